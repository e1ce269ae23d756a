//! Error types for the content store.

use thiserror::Error;

use flowrepo_core::ContentClaim;

/// Result type alias for content store operations.
pub type ContentResult<T> = Result<T, ContentError>;

/// Error variants for content store operations.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The claimed bytes are gone or damaged. Fatal for the FlowFile, not for the process.
    #[error("Content missing for claim {claim}: {reason}")]
    ContentMissing {
        /// The unreadable claim.
        claim: ContentClaim,
        /// What was found instead.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContentError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ContentError::ContentMissing { .. } => false,
            ContentError::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrepo_core::ResourceClaim;

    #[test]
    fn test_content_missing_display() {
        let claim = ContentClaim::new(ResourceClaim::new(12, 3), 64, 100);
        let err = ContentError::ContentMissing {
            claim,
            reason: "container reclaimed".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3/12@64+100"));
        assert!(msg.contains("container reclaimed"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_error_is_retryable() {
        let err: ContentError = std::io::Error::other("disk busy").into();
        assert!(err.is_retryable());
    }
}

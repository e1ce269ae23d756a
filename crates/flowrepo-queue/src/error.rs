//! Error types for connection queues.

use thiserror::Error;

use flowrepo_core::{CodecError, ConnectionId};

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error variants for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A hard ceiling would be exceeded.
    #[error("Queue {connection} is full: {reason}")]
    QueueFull {
        /// The full queue.
        connection: ConnectionId,
        /// Which ceiling was hit.
        reason: String,
    },

    /// The ledger references a swap file that is not on disk.
    #[error("Swap file missing: {location}")]
    SwapFileMissing {
        /// Swap file name.
        location: String,
    },

    /// A swap file exists but cannot be read back.
    #[error("Swap file {location} is corrupt: {reason}")]
    SwapCorruption {
        /// Swap file name.
        location: String,
        /// What was wrong.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Recording a swap in the ledger failed.
    #[error("Swap recorder error: {0}")]
    Recorder(String),
}

impl QueueError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::QueueFull { .. } | QueueError::Io(_) | QueueError::Recorder(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_retryable() {
        let err = QueueError::QueueFull {
            connection: ConnectionId::new("out"),
            reason: "object limit 10 reached".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("out"));
    }

    #[test]
    fn test_swap_errors_not_retryable() {
        let missing = QueueError::SwapFileMissing {
            location: "out-3.swap".to_string(),
        };
        let corrupt = QueueError::SwapCorruption {
            location: "out-4.swap".to_string(),
            reason: "trailer count mismatch".to_string(),
        };
        assert!(!missing.is_retryable());
        assert!(!corrupt.is_retryable());
        assert!(corrupt.to_string().contains("trailer count mismatch"));
    }
}

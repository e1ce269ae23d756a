//! Error types for the FlowFile ledger.

use std::path::PathBuf;

use thiserror::Error;

use flowrepo_core::CodecError;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error variants for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Persisted ledger state cannot be trusted; the node must not start.
    #[error("Ledger corruption in {path} at offset {offset}: {reason}")]
    LedgerCorruption {
        /// File the bad data was found in.
        path: PathBuf,
        /// Byte offset of the bad frame.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl LedgerError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Io(_))
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        LedgerError::LedgerCorruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }
}

//! Error types for process sessions and the repository.

use thiserror::Error;

use flowrepo_content::ContentError;
use flowrepo_core::{ConfigError, ConnectionId, FlowFileId};
use flowrepo_ledger::LedgerError;
use flowrepo_queue::QueueError;

/// Result type alias for session and repository operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Error variants for session and repository operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was used after commit or rollback.
    #[error("Session protocol violation: {0}")]
    SessionProtocolViolation(String),

    /// The FlowFile does not belong to this session.
    #[error("Unknown FlowFile {0}")]
    UnknownFlowFile(FlowFileId),

    /// The caller passed an outdated version of a FlowFile.
    #[error("Stale FlowFile {id}: version {given} is not the current version {current}")]
    StaleFlowFile {
        /// The FlowFile.
        id: FlowFileId,
        /// Version passed by the caller.
        given: u64,
        /// Version held by the session.
        current: u64,
    },

    /// Commit found a FlowFile that was neither transferred nor removed.
    #[error("FlowFile {0} was neither transferred nor removed")]
    UnaccountedFlowFile(FlowFileId),

    /// No queue exists for the connection.
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Content store failure.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether retrying the same work later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Content(e) => e.is_retryable(),
            SessionError::Ledger(e) => e.is_retryable(),
            SessionError::Queue(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#![warn(missing_docs)]

//! flowrepo subsystem: atomic process sessions over the content store,
//! ledger and connection queues, plus the repository that wires them
//! together, stage scheduling and background maintenance.

pub mod error;
pub mod maintenance;
pub mod repository;
pub mod scheduler;
pub mod session;

pub use error::{SessionError, SessionResult};
pub use maintenance::{MaintenanceStats, MaintenanceTasks};
pub use repository::{FlowRepository, LedgerSwapRecorder, RepositoryStatus};
pub use scheduler::{
    RunnerSettings, RunnerStats, Stage, StageError, StageRunner, TriggerOutcome, WorkerPool,
};
pub use session::{CommitSummary, ProcessSession, SessionState, StandardProcessSession};

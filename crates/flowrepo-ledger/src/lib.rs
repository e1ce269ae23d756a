#![warn(missing_docs)]

//! flowrepo subsystem: partitioned write-ahead FlowFile ledger with snapshots
//! and crash recovery.
//!
//! Sessions append one [`LedgerBatch`] per commit. Batches go to whichever
//! partition log is free, carry a contiguous range of the global sequence,
//! and are replayed in sequence order on recovery. Checkpoints rotate every
//! partition to a new log generation and write the live index as a snapshot.

pub mod error;
pub mod index;
pub mod ledger;
pub mod partition;
pub mod record;
pub mod recovery;
pub mod snapshot;

pub use error::{LedgerError, LedgerResult};
pub use index::{LiveEntry, LiveIndex, SwapLocation};
pub use ledger::{CheckpointStats, Ledger, LedgerStats, WriteAheadLedger};
pub use record::{LedgerBatch, LedgerRecord, RecordKind};
pub use recovery::{RecoveredLedger, RecoveryReport};
pub use snapshot::Snapshot;

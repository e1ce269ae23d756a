//! Ledger records and batches.

use serde::{Deserialize, Serialize};

use flowrepo_core::{ConnectionId, FlowFileId, FlowFileRecord};

/// What a ledger record says happened to a FlowFile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// The FlowFile was created and queued.
    Create,
    /// The FlowFile moved to a queue or changed while crossing one.
    Update,
    /// The FlowFile left the flow.
    Delete,
    /// The queued FlowFile was written to a swap file.
    SwapOut,
    /// The FlowFile was read back from a swap file into its queue.
    SwapIn,
}

/// One durable change to a FlowFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Global sequence number, assigned by the ledger on append.
    pub sequence: u64,
    /// Kind of change.
    pub kind: RecordKind,
    /// The FlowFile concerned.
    pub flowfile_id: FlowFileId,
    /// Queue holding the FlowFile after the change (`None` for deletes).
    pub connection: Option<ConnectionId>,
    /// Full FlowFile state after the change.
    pub flowfile: FlowFileRecord,
    /// Swap file for SwapOut and SwapIn records.
    pub swap_location: Option<String>,
}

impl LedgerRecord {
    fn new(
        kind: RecordKind,
        flowfile: FlowFileRecord,
        connection: Option<ConnectionId>,
        swap_location: Option<String>,
    ) -> Self {
        Self {
            sequence: 0,
            kind,
            flowfile_id: flowfile.id,
            connection,
            flowfile,
            swap_location,
        }
    }

    /// A new FlowFile queued on `connection`.
    pub fn create(flowfile: FlowFileRecord, connection: ConnectionId) -> Self {
        Self::new(RecordKind::Create, flowfile, Some(connection), None)
    }

    /// An existing FlowFile queued on `connection`.
    pub fn update(flowfile: FlowFileRecord, connection: ConnectionId) -> Self {
        Self::new(RecordKind::Update, flowfile, Some(connection), None)
    }

    /// A FlowFile leaving the flow.
    pub fn delete(flowfile: FlowFileRecord) -> Self {
        Self::new(RecordKind::Delete, flowfile, None, None)
    }

    /// A queued FlowFile written to `location`.
    pub fn swap_out(flowfile: FlowFileRecord, connection: ConnectionId, location: impl Into<String>) -> Self {
        Self::new(RecordKind::SwapOut, flowfile, Some(connection), Some(location.into()))
    }

    /// A FlowFile read back from `location`.
    pub fn swap_in(flowfile: FlowFileRecord, connection: ConnectionId, location: impl Into<String>) -> Self {
        Self::new(RecordKind::SwapIn, flowfile, Some(connection), Some(location.into()))
    }
}

/// The records of one session, framed and checksummed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBatch {
    /// Transaction id shared by every record of the batch.
    pub transaction_id: u64,
    /// Sequence of the first record; the rest follow contiguously.
    pub first_sequence: u64,
    /// The records, in sequence order.
    pub records: Vec<LedgerRecord>,
}

impl LedgerBatch {
    /// Sequence of the last record.
    pub fn last_sequence(&self) -> u64 {
        self.first_sequence + self.records.len().saturating_sub(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let ff = FlowFileRecord::new(FlowFileId::new(9));
        let rec = LedgerRecord::swap_out(ff.clone(), ConnectionId::new("c"), "swap/c-1.swap");
        assert_eq!(rec.kind, RecordKind::SwapOut);
        assert_eq!(rec.flowfile_id, FlowFileId::new(9));
        assert_eq!(rec.swap_location.as_deref(), Some("swap/c-1.swap"));

        let del = LedgerRecord::delete(ff);
        assert!(del.connection.is_none());
        assert!(del.swap_location.is_none());
    }

    #[test]
    fn test_last_sequence() {
        let ff = FlowFileRecord::new(FlowFileId::new(1));
        let batch = LedgerBatch {
            transaction_id: 4,
            first_sequence: 10,
            records: vec![LedgerRecord::delete(ff.clone()), LedgerRecord::delete(ff)],
        };
        assert_eq!(batch.last_sequence(), 11);
    }
}

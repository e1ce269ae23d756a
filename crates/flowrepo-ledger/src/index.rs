//! The live FlowFile index maintained by applying ledger records.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use flowrepo_core::{ConnectionId, ContentClaim, FlowFileId, FlowFileRecord};

use crate::record::{LedgerBatch, LedgerRecord, RecordKind};

/// A FlowFile held in memory by a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    /// Queue holding the FlowFile.
    pub connection: ConnectionId,
    /// Latest committed state.
    pub flowfile: FlowFileRecord,
}

/// A swap file the ledger knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLocation {
    /// Queue the swap file belongs to.
    pub connection: ConnectionId,
    /// FlowFiles recorded as swapped out to it and not yet swapped in.
    pub count: u64,
}

/// Committed FlowFile state: in-memory records plus swap file locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveIndex {
    flowfiles: BTreeMap<FlowFileId, LiveEntry>,
    swap_locations: BTreeMap<String, SwapLocation>,
    max_flowfile_id: Option<u64>,
    max_queue_index: Option<u64>,
    max_sequence: Option<u64>,
    max_transaction: Option<u64>,
}

impl LiveIndex {
    /// Applies every record of `batch`.
    pub fn apply_batch(&mut self, batch: &LedgerBatch) {
        self.max_transaction = self.max_transaction.max(Some(batch.transaction_id));
        for record in &batch.records {
            self.apply(record);
        }
    }

    /// Applies one record.
    pub fn apply(&mut self, record: &LedgerRecord) {
        self.max_sequence = self.max_sequence.max(Some(record.sequence));
        self.max_flowfile_id = self.max_flowfile_id.max(Some(record.flowfile_id.as_u64()));
        self.max_queue_index = self
            .max_queue_index
            .max(Some(record.flowfile.queue_date_index));

        match record.kind {
            RecordKind::Create | RecordKind::Update => {
                let Some(connection) = record.connection.clone() else {
                    warn!(flowfile = %record.flowfile_id, sequence = record.sequence, "queued record without connection");
                    return;
                };
                self.flowfiles.insert(
                    record.flowfile_id,
                    LiveEntry {
                        connection,
                        flowfile: record.flowfile.clone(),
                    },
                );
            }
            RecordKind::Delete => {
                self.flowfiles.remove(&record.flowfile_id);
            }
            RecordKind::SwapOut => {
                self.flowfiles.remove(&record.flowfile_id);
                if let (Some(location), Some(connection)) = (&record.swap_location, &record.connection) {
                    self.swap_locations
                        .entry(location.clone())
                        .or_insert_with(|| SwapLocation {
                            connection: connection.clone(),
                            count: 0,
                        })
                        .count += 1;
                }
            }
            RecordKind::SwapIn => {
                if let Some(location) = &record.swap_location {
                    let drained = match self.swap_locations.get_mut(location) {
                        Some(entry) => {
                            entry.count = entry.count.saturating_sub(1);
                            entry.count == 0
                        }
                        None => false,
                    };
                    if drained {
                        self.swap_locations.remove(location);
                    }
                }
                if let Some(connection) = record.connection.clone() {
                    self.flowfiles.insert(
                        record.flowfile_id,
                        LiveEntry {
                            connection,
                            flowfile: record.flowfile.clone(),
                        },
                    );
                }
            }
        }
    }

    /// In-memory FlowFiles by id.
    pub fn flowfiles(&self) -> &BTreeMap<FlowFileId, LiveEntry> {
        &self.flowfiles
    }

    /// Known swap files.
    pub fn swap_locations(&self) -> &BTreeMap<String, SwapLocation> {
        &self.swap_locations
    }

    /// Number of in-memory FlowFiles.
    pub fn len(&self) -> usize {
        self.flowfiles.len()
    }

    /// True when no FlowFile is live in memory.
    pub fn is_empty(&self) -> bool {
        self.flowfiles.is_empty()
    }

    /// Highest sequence applied so far.
    pub fn max_sequence(&self) -> Option<u64> {
        self.max_sequence
    }

    /// Highest transaction id applied so far.
    pub fn max_transaction(&self) -> Option<u64> {
        self.max_transaction
    }

    /// Id the next FlowFile should get.
    pub fn next_flowfile_id(&self) -> u64 {
        self.max_flowfile_id.map(|m| m + 1).unwrap_or(1)
    }

    /// Queue index the next enqueue should get.
    pub fn next_queue_index(&self) -> u64 {
        self.max_queue_index.map(|m| m + 1).unwrap_or(1)
    }

    /// Claim reference counts held by the in-memory FlowFiles.
    pub fn claim_counts(&self) -> HashMap<ContentClaim, u64> {
        let mut counts = HashMap::new();
        for entry in self.flowfiles.values() {
            if let Some(claim) = entry.flowfile.claim {
                *counts.entry(claim).or_insert(0) += 1;
            }
        }
        counts
    }
}

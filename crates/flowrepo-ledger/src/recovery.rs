//! Rebuilding the live index from the snapshot and the partition logs.
//!
//! Torn frames are tolerated only at the tail of a partition's newest
//! generation, where an interrupted append can leave them; there the log is
//! truncated at the torn frame. Anywhere else a bad frame means data the
//! ledger already acknowledged is damaged, and recovery fails.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use tracing::{error, info, warn};

use flowrepo_core::codec::FRAME_HEADER_LEN;
use flowrepo_core::{
    read_raw_frame, CodecError, ConnectionId, ContentClaim, FlowFileRecord, Frame, FrameReader,
    RawFrame,
};

use crate::error::{LedgerError, LedgerResult};
use crate::index::LiveIndex;
use crate::partition::{generation_path, list_generations, list_partitions};
use crate::record::LedgerBatch;
use crate::snapshot::load_snapshot;

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Generation recorded in the snapshot, if one was loaded.
    pub snapshot_generation: Option<u64>,
    /// Log files read.
    pub logs_replayed: usize,
    /// Batches applied on top of the snapshot.
    pub batches_replayed: usize,
    /// Records applied on top of the snapshot.
    pub records_replayed: usize,
    /// Logs whose torn tail was cut off.
    pub torn_tails_truncated: usize,
    /// Logs already covered by the snapshot and deleted.
    pub stale_logs_removed: usize,
    /// FlowFiles live in memory after recovery.
    pub live_flowfiles: usize,
    /// Swap files still referenced after recovery.
    pub swap_locations: usize,
}

/// Committed state handed back to the repository at startup.
#[derive(Debug, Clone, Default)]
pub struct RecoveredLedger {
    /// In-memory FlowFiles per queue, in enqueue order.
    pub flowfiles: BTreeMap<ConnectionId, Vec<FlowFileRecord>>,
    /// Swap files per queue.
    pub swap_locations: BTreeMap<ConnectionId, Vec<String>>,
    /// Claim reference counts held by the in-memory FlowFiles.
    pub claim_counts: HashMap<ContentClaim, u64>,
    /// Id the next FlowFile should get.
    pub next_flowfile_id: u64,
    /// Queue index the next enqueue should get.
    pub next_queue_index: u64,
    /// Highest sequence recovered.
    pub max_sequence: Option<u64>,
    /// Details of the recovery run.
    pub report: RecoveryReport,
}

impl RecoveredLedger {
    pub(crate) fn from_index(index: &LiveIndex, mut report: RecoveryReport) -> Self {
        let mut flowfiles: BTreeMap<ConnectionId, Vec<FlowFileRecord>> = BTreeMap::new();
        for entry in index.flowfiles().values() {
            flowfiles
                .entry(entry.connection.clone())
                .or_default()
                .push(entry.flowfile.clone());
        }
        for records in flowfiles.values_mut() {
            records.sort_by_key(|r| (r.queue_date_index, r.id));
        }

        let mut swap_locations: BTreeMap<ConnectionId, Vec<String>> = BTreeMap::new();
        for (location, entry) in index.swap_locations() {
            swap_locations
                .entry(entry.connection.clone())
                .or_default()
                .push(location.clone());
        }

        report.live_flowfiles = index.len();
        report.swap_locations = index.swap_locations().len();
        Self {
            flowfiles,
            swap_locations,
            claim_counts: index.claim_counts(),
            next_flowfile_id: index.next_flowfile_id(),
            next_queue_index: index.next_queue_index(),
            max_sequence: index.max_sequence(),
            report,
        }
    }
}

/// Result of replaying the on-disk state.
#[derive(Debug)]
pub(crate) struct Replay {
    pub index: LiveIndex,
    pub report: RecoveryReport,
    /// First generation no existing log or snapshot uses.
    pub next_generation: u64,
}

/// Loads the snapshot and replays every log generation it does not cover.
pub(crate) fn replay(root: &Path) -> LedgerResult<Replay> {
    let snapshot = load_snapshot(root).map_err(|e| {
        error!(error = %e, "ledger snapshot unreadable");
        e
    })?;
    let mut report = RecoveryReport::default();
    let (base_generation, mut index) = match snapshot {
        Some(s) => {
            report.snapshot_generation = Some(s.generation);
            (s.generation, s.index)
        }
        None => (0, LiveIndex::default()),
    };
    let mut next_generation = base_generation.max(1);

    let mut batches = Vec::new();
    for partition in list_partitions(root)? {
        let generations = list_generations(root, partition)?;
        let newest = generations.last().copied();
        for generation in generations {
            next_generation = next_generation.max(generation + 1);
            let path = generation_path(root, partition, generation);
            if generation < base_generation {
                fs::remove_file(&path)?;
                report.stale_logs_removed += 1;
                continue;
            }
            let (mut found, truncated) = read_log(&path, Some(generation) == newest)?;
            report.logs_replayed += 1;
            if truncated {
                report.torn_tails_truncated += 1;
            }
            batches.append(&mut found);
        }
    }

    batches.sort_by_key(|b| b.first_sequence);
    for batch in &batches {
        index.apply_batch(batch);
        report.records_replayed += batch.records.len();
    }
    report.batches_replayed = batches.len();

    info!(
        snapshot_generation = ?report.snapshot_generation,
        logs = report.logs_replayed,
        batches = report.batches_replayed,
        records = report.records_replayed,
        truncated = report.torn_tails_truncated,
        "ledger replay complete"
    );
    Ok(Replay {
        index,
        report,
        next_generation,
    })
}

/// Reads every batch of one log file.
///
/// Returns the batches and whether a torn tail was truncated.
fn read_log(path: &Path, newest: bool) -> LedgerResult<(Vec<LedgerBatch>, bool)> {
    let file = File::open(path)?;
    let mut reader = FrameReader::new(BufReader::new(file));
    let mut batches = Vec::new();
    loop {
        match reader.next_frame::<LedgerBatch>() {
            Ok(Frame::Value { value, .. }) => batches.push(value),
            Ok(Frame::End) => return Ok((batches, false)),
            Ok(Frame::Torn {
                offset,
                declared_len,
                reason,
            }) => {
                if !newest {
                    error!(path = %path.display(), offset, reason, "torn frame in sealed log generation");
                    return Err(LedgerError::corruption(path, offset, reason));
                }
                if valid_frame_follows(path, offset, declared_len)? {
                    error!(path = %path.display(), offset, reason, "bad frame followed by valid data");
                    return Err(LedgerError::corruption(
                        path,
                        offset,
                        format!("{} followed by a valid frame", reason),
                    ));
                }
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                warn!(path = %path.display(), offset, reason, "truncated torn ledger tail");
                return Ok((batches, true));
            }
            Err(CodecError::Decode(reason)) => {
                return Err(LedgerError::corruption(path, reader.offset(), reason));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn valid_frame_follows(path: &Path, offset: u64, declared_len: Option<u32>) -> LedgerResult<bool> {
    let Some(len) = declared_len else {
        return Ok(false);
    };
    let mut file = File::open(path)?;
    let next = offset + FRAME_HEADER_LEN + u64::from(len);
    if next >= file.metadata()?.len() {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(next))?;
    Ok(matches!(
        read_raw_frame(&mut BufReader::new(file))?,
        RawFrame::Payload(_)
    ))
}

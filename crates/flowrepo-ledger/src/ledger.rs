//! The partitioned write-ahead FlowFile ledger.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use flowrepo_core::{encode_frame, LedgerConfig};

use crate::error::LedgerResult;
use crate::index::LiveIndex;
use crate::partition::{generation_path, list_generations, list_partitions, Partition};
use crate::record::{LedgerBatch, LedgerRecord};
use crate::recovery::{replay, RecoveredLedger};
use crate::snapshot::{write_snapshot, Snapshot};

/// Durable log of FlowFile changes.
pub trait Ledger: Send + Sync {
    /// Appends a single record. Returns the transaction id once durable.
    fn append(&self, record: LedgerRecord) -> LedgerResult<u64> {
        self.append_batch(vec![record])
    }

    /// Appends `records` as one atomic batch. Returns the transaction id once durable.
    fn append_batch(&self, records: Vec<LedgerRecord>) -> LedgerResult<u64>;

    /// Writes a snapshot and drops the log generations it covers.
    fn checkpoint(&self) -> LedgerResult<CheckpointStats>;

    /// Rebuilds the committed state from disk.
    fn recover(&self) -> LedgerResult<RecoveredLedger>;
}

/// Statistics from one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// First generation not covered by the snapshot.
    pub generation: u64,
    /// FlowFiles in the snapshot.
    pub live_flowfiles: usize,
    /// Swap files in the snapshot.
    pub swap_locations: usize,
    /// Snapshot size in bytes.
    pub snapshot_bytes: u64,
    /// Log files deleted.
    pub logs_removed: usize,
    /// Wall time spent.
    pub duration_ms: u64,
}

/// Counters exposed by [`WriteAheadLedger::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Batches appended since open.
    pub batches_appended: u64,
    /// Records appended since open.
    pub records_appended: u64,
    /// Checkpoints completed since open.
    pub checkpoints: u64,
    /// Generation partitions currently append to.
    pub generation: u64,
    /// FlowFiles live in memory.
    pub live_flowfiles: usize,
    /// Swap files referenced.
    pub swap_locations: usize,
}

/// File-backed [`Ledger`] spreading batches over several partition logs.
///
/// [`Ledger::recover`] must run before the first append.
#[derive(Debug)]
pub struct WriteAheadLedger {
    root: PathBuf,
    config: LedgerConfig,
    partitions: Vec<Mutex<Partition>>,
    next_partition: AtomicUsize,
    sequence: AtomicU64,
    transaction: AtomicU64,
    generation: AtomicU64,
    index: RwLock<LiveIndex>,
    checkpoint_lock: Mutex<()>,
    batches_appended: AtomicU64,
    records_appended: AtomicU64,
    checkpoints: AtomicU64,
}

impl WriteAheadLedger {
    /// Opens the ledger rooted at `dir`. Nothing is read until [`Ledger::recover`].
    pub fn open(config: &LedgerConfig, dir: &Path) -> LedgerResult<Self> {
        fs::create_dir_all(dir)?;
        let mut generation = 1;
        for partition in list_partitions(dir)? {
            if let Some(newest) = list_generations(dir, partition)?.last() {
                generation = generation.max(newest + 1);
            }
        }
        let partitions = (0..config.partitions.max(1))
            .map(|i| Mutex::new(Partition::new(dir, i, generation)))
            .collect();
        info!(dir = %dir.display(), partitions = config.partitions, generation, "opened ledger");
        Ok(Self {
            root: dir.to_path_buf(),
            config: config.clone(),
            partitions,
            next_partition: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            transaction: AtomicU64::new(0),
            generation: AtomicU64::new(generation),
            index: RwLock::new(LiveIndex::default()),
            checkpoint_lock: Mutex::new(()),
            batches_appended: AtomicU64::new(0),
            records_appended: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        })
    }

    /// Root directory of the ledger.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy of the live index.
    pub fn live_index(&self) -> LiveIndex {
        self.index.read().clone()
    }

    /// Snapshot of the ledger counters.
    pub fn stats(&self) -> LedgerStats {
        let index = self.index.read();
        LedgerStats {
            batches_appended: self.batches_appended.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Acquire),
            live_flowfiles: index.len(),
            swap_locations: index.swap_locations().len(),
        }
    }

    /// Flushes every partition to stable storage.
    pub fn sync_all(&self) -> LedgerResult<()> {
        for partition in &self.partitions {
            partition.lock().sync()?;
        }
        Ok(())
    }

    /// Picks a partition round-robin, preferring one nobody holds.
    fn lock_partition(&self) -> MutexGuard<'_, Partition> {
        let n = self.partitions.len();
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            if let Some(guard) = self.partitions[(start + i) % n].try_lock() {
                return guard;
            }
        }
        self.partitions[start % n].lock()
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, Partition>> {
        self.partitions.iter().map(|p| p.lock()).collect()
    }

    fn remove_generations_below(&self, generation: u64) -> LedgerResult<usize> {
        let mut removed = 0;
        for partition in list_partitions(&self.root)? {
            for old in list_generations(&self.root, partition)? {
                if old >= generation {
                    break;
                }
                let path = generation_path(&self.root, partition, old);
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove checkpointed log");
                    }
                }
            }
        }
        Ok(removed)
    }
}

impl Ledger for WriteAheadLedger {
    fn append_batch(&self, mut records: Vec<LedgerRecord>) -> LedgerResult<u64> {
        let mut partition = self.lock_partition();
        let transaction_id = self.transaction.fetch_add(1, Ordering::SeqCst);
        if records.is_empty() {
            return Ok(transaction_id);
        }

        let first_sequence = self
            .sequence
            .fetch_add(records.len() as u64, Ordering::SeqCst);
        for (i, record) in records.iter_mut().enumerate() {
            record.sequence = first_sequence + i as u64;
        }
        let batch = LedgerBatch {
            transaction_id,
            first_sequence,
            records,
        };
        let frame = encode_frame(&batch)?;
        partition.append(&frame, self.config.sync_mode)?;
        self.index.write().apply_batch(&batch);
        drop(partition);

        self.batches_appended.fetch_add(1, Ordering::Relaxed);
        self.records_appended
            .fetch_add(batch.records.len() as u64, Ordering::Relaxed);
        debug!(
            transaction = transaction_id,
            first_sequence,
            records = batch.records.len(),
            "ledger batch appended"
        );
        Ok(transaction_id)
    }

    fn checkpoint(&self) -> LedgerResult<CheckpointStats> {
        let _checkpoint = self.checkpoint_lock.lock();
        let started = Instant::now();

        let snapshot = {
            let mut partitions = self.lock_all();
            let generation = self.generation.load(Ordering::Acquire) + 1;
            self.generation.store(generation, Ordering::Release);
            for partition in partitions.iter_mut() {
                partition.rotate(generation)?;
            }
            Snapshot {
                generation,
                index: self.index.read().clone(),
            }
        };

        let snapshot_bytes = write_snapshot(&self.root, &snapshot)?;
        let logs_removed = self.remove_generations_below(snapshot.generation)?;
        self.checkpoints.fetch_add(1, Ordering::Relaxed);

        let stats = CheckpointStats {
            generation: snapshot.generation,
            live_flowfiles: snapshot.index.len(),
            swap_locations: snapshot.index.swap_locations().len(),
            snapshot_bytes,
            logs_removed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            generation = stats.generation,
            flowfiles = stats.live_flowfiles,
            bytes = stats.snapshot_bytes,
            logs_removed = stats.logs_removed,
            duration_ms = stats.duration_ms,
            "ledger checkpoint complete"
        );
        Ok(stats)
    }

    fn recover(&self) -> LedgerResult<RecoveredLedger> {
        let _checkpoint = self.checkpoint_lock.lock();
        let mut partitions = self.lock_all();

        let replayed = replay(&self.root)?;
        let generation = replayed
            .next_generation
            .max(self.generation.load(Ordering::Acquire));
        for partition in partitions.iter_mut() {
            partition.rotate(generation)?;
        }
        self.generation.store(generation, Ordering::Release);

        let index = replayed.index;
        self.sequence.store(
            index.max_sequence().map(|s| s + 1).unwrap_or(0),
            Ordering::SeqCst,
        );
        self.transaction.store(
            index.max_transaction().map(|t| t + 1).unwrap_or(0),
            Ordering::SeqCst,
        );
        let recovered = RecoveredLedger::from_index(&index, replayed.report);
        *self.index.write() = index;

        info!(
            flowfiles = recovered.report.live_flowfiles,
            swap_locations = recovered.report.swap_locations,
            next_flowfile_id = recovered.next_flowfile_id,
            generation,
            "ledger recovered"
        );
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrepo_core::{ConnectionId, FlowFileId, FlowFileRecord, SyncMode};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(partitions: usize) -> LedgerConfig {
        LedgerConfig {
            partitions,
            sync_mode: SyncMode::Sync,
            ..LedgerConfig::default()
        }
    }

    fn open(dir: &Path, partitions: usize) -> WriteAheadLedger {
        let ledger = WriteAheadLedger::open(&config(partitions), dir).unwrap();
        ledger.recover().unwrap();
        ledger
    }

    fn ff(id: u64) -> FlowFileRecord {
        FlowFileRecord::new(FlowFileId::new(id))
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let dir = TempDir::new().unwrap();
        let ledger = open(dir.path(), 2);
        let q = ConnectionId::new("q");
        ledger
            .append_batch(vec![
                LedgerRecord::create(ff(1), q.clone()),
                LedgerRecord::create(ff(2), q.clone()),
            ])
            .unwrap();
        ledger.append(LedgerRecord::delete(ff(1))).unwrap();
        let index = ledger.live_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index.max_sequence(), Some(2));
        assert_eq!(ledger.stats().records_appended, 3);
    }

    #[test]
    fn test_recover_after_reopen() {
        let dir = TempDir::new().unwrap();
        let q = ConnectionId::new("q");
        {
            let ledger = open(dir.path(), 4);
            for id in 1..=10 {
                ledger
                    .append(LedgerRecord::create(ff(id).with_queue_entry(0, id), q.clone()))
                    .unwrap();
            }
            ledger.append(LedgerRecord::delete(ff(3))).unwrap();
        }
        let ledger = WriteAheadLedger::open(&config(4), dir.path()).unwrap();
        let recovered = ledger.recover().unwrap();
        let records = &recovered.flowfiles[&q];
        assert_eq!(records.len(), 9);
        assert!(records.windows(2).all(|w| w[0].queue_date_index < w[1].queue_date_index));
        assert_eq!(recovered.next_flowfile_id, 11);
        assert_eq!(recovered.next_queue_index, 11);
        assert_eq!(recovered.max_sequence, Some(10));

        ledger.append(LedgerRecord::delete(ff(4))).unwrap();
        assert_eq!(ledger.live_index().max_sequence(), Some(11));
    }

    #[test]
    fn test_checkpoint_removes_old_generations() {
        let dir = TempDir::new().unwrap();
        let q = ConnectionId::new("q");
        let ledger = open(dir.path(), 2);
        for id in 1..=4 {
            ledger.append(LedgerRecord::create(ff(id), q.clone())).unwrap();
        }
        let stats = ledger.checkpoint().unwrap();
        assert_eq!(stats.live_flowfiles, 4);
        assert_eq!(stats.logs_removed, 2);
        ledger.append(LedgerRecord::delete(ff(2))).unwrap();
        drop(ledger);

        let reopened = WriteAheadLedger::open(&config(2), dir.path()).unwrap();
        let recovered = reopened.recover().unwrap();
        assert_eq!(recovered.report.snapshot_generation, Some(stats.generation));
        assert_eq!(recovered.report.batches_replayed, 1);
        assert_eq!(recovered.flowfiles[&q].len(), 3);
    }

    #[test]
    fn test_checkpoint_without_writes_then_recover() {
        let dir = TempDir::new().unwrap();
        let q = ConnectionId::new("q");
        {
            let ledger = open(dir.path(), 1);
            ledger.append(LedgerRecord::create(ff(1), q.clone())).unwrap();
            ledger.checkpoint().unwrap();
            ledger.checkpoint().unwrap();
        }
        let ledger = WriteAheadLedger::open(&config(1), dir.path()).unwrap();
        let recovered = ledger.recover().unwrap();
        assert_eq!(recovered.flowfiles[&q].len(), 1);
        ledger.append(LedgerRecord::create(ff(2), q.clone())).unwrap();
        drop(ledger);

        let ledger = WriteAheadLedger::open(&config(1), dir.path()).unwrap();
        assert_eq!(ledger.recover().unwrap().flowfiles[&q].len(), 2);
    }

    #[test]
    fn test_concurrent_appends() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(open(dir.path(), 4));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let q = ConnectionId::new(format!("q{}", t % 2));
                    for i in 0..25u64 {
                        let id = t * 100 + i + 1;
                        ledger.append(LedgerRecord::create(ff(id), q.clone())).unwrap();
                    }
                })
            })
            .collect();
        let checkpointer = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    ledger.checkpoint().unwrap();
                }
            })
        };
        for handle in handles {
            handle.join().unwrap();
        }
        checkpointer.join().unwrap();
        assert_eq!(ledger.live_index().len(), 200);
        drop(ledger);

        let reopened = WriteAheadLedger::open(&config(4), dir.path()).unwrap();
        let recovered = reopened.recover().unwrap();
        let total: usize = recovered.flowfiles.values().map(Vec::len).sum();
        assert_eq!(total, 200);
        assert_eq!(recovered.max_sequence, Some(199));
    }
}

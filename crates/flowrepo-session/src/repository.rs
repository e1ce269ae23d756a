//! The repository: content store, ledger and queues wired together.
//!
//! [`FlowRepository::open`] recovers committed state in a fixed order:
//! ledger replay, swap file verification, claim count restoration, then
//! orphan cleanup for containers and swap files. Only after that are the
//! queues filled and sessions handed out.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use flowrepo_content::{ContentStats, ContentStore, ReclaimStats};
use flowrepo_core::{
    ConnectionConfig, ConnectionId, ContentClaim, FlowFileId, FlowFileRecord, QueueSettings,
    RepositoryConfig,
};
use flowrepo_ledger::{
    CheckpointStats, Ledger, LedgerRecord, LedgerStats, RecoveryReport, WriteAheadLedger,
};
use flowrepo_queue::{
    ConnectionQueue, FlowFileQueue, QueueError, QueueOrder, QueueResult, QueueSize, SwapManager,
    SwapRecorder, SwapSummary,
};

use crate::error::{SessionError, SessionResult};
use crate::session::{ProcessSession, StandardProcessSession};

/// Makes swap events durable by appending SwapOut/SwapIn batches to the ledger.
#[derive(Debug)]
pub struct LedgerSwapRecorder {
    ledger: Arc<WriteAheadLedger>,
}

impl LedgerSwapRecorder {
    /// Recorder appending to `ledger`.
    pub fn new(ledger: Arc<WriteAheadLedger>) -> Self {
        Self { ledger }
    }

    fn append(&self, records: Vec<LedgerRecord>) -> QueueResult<()> {
        self.ledger
            .append_batch(records)
            .map(|_| ())
            .map_err(|e| QueueError::Recorder(e.to_string()))
    }
}

impl SwapRecorder for LedgerSwapRecorder {
    fn swapped_out(&self, connection: &ConnectionId, location: &str, records: &[FlowFileRecord]) -> QueueResult<()> {
        self.append(
            records
                .iter()
                .map(|r| LedgerRecord::swap_out(r.clone(), connection.clone(), location))
                .collect(),
        )
    }

    fn swapped_in(&self, connection: &ConnectionId, location: &str, records: &[FlowFileRecord]) -> QueueResult<()> {
        self.append(
            records
                .iter()
                .map(|r| LedgerRecord::swap_in(r.clone(), connection.clone(), location))
                .collect(),
        )
    }
}

/// Point-in-time view of the whole repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStatus {
    /// Size of every queue.
    pub connections: BTreeMap<ConnectionId, QueueSize>,
    /// Content store counters.
    pub content: ContentStats,
    /// Ledger counters.
    pub ledger: LedgerStats,
    /// Sessions committed since open.
    pub sessions_committed: u64,
    /// Sessions rolled back since open, explicitly or not.
    pub sessions_rolled_back: u64,
}

/// State shared by the repository handle and every session it creates.
pub(crate) struct RepositoryInner {
    pub(crate) config: RepositoryConfig,
    pub(crate) content: Arc<ContentStore>,
    pub(crate) ledger: Arc<WriteAheadLedger>,
    swap: Arc<SwapManager>,
    recorder: Arc<dyn SwapRecorder>,
    queues: RwLock<BTreeMap<ConnectionId, Arc<ConnectionQueue>>>,
    next_flowfile_id: AtomicU64,
    next_queue_index: AtomicU64,
    sessions_committed: AtomicU64,
    sessions_rolled_back: AtomicU64,
}

impl std::fmt::Debug for RepositoryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryInner")
            .field("data_dir", &self.config.data_dir)
            .field("connections", &self.queues.read().len())
            .field("next_flowfile_id", &self.next_flowfile_id)
            .finish_non_exhaustive()
    }
}

impl RepositoryInner {
    pub(crate) fn queue(&self, id: &ConnectionId) -> SessionResult<Arc<ConnectionQueue>> {
        self.queues
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownConnection(id.clone()))
    }

    pub(crate) fn next_flowfile_id(&self) -> FlowFileId {
        FlowFileId::new(self.next_flowfile_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_queue_index(&self) -> u64 {
        self.next_queue_index.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn note_committed(&self) {
        self.sessions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_rolled_back(&self) {
        self.sessions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn build_queue(&self, connection: &ConnectionConfig) -> ConnectionQueue {
        build_queue(connection, &self.config.queue_defaults, &self.swap, &self.recorder)
    }
}

fn build_queue(
    connection: &ConnectionConfig,
    defaults: &QueueSettings,
    swap: &Arc<SwapManager>,
    recorder: &Arc<dyn SwapRecorder>,
) -> ConnectionQueue {
    ConnectionQueue::new(
        connection.id.clone(),
        connection.settings(defaults),
        QueueOrder::from_kinds(&connection.prioritizers),
        Arc::clone(swap),
        Arc::clone(recorder),
    )
}

/// Handle to an open repository. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct FlowRepository {
    inner: Arc<RepositoryInner>,
}

impl FlowRepository {
    /// Opens the repository under `config.data_dir` and recovers committed state.
    ///
    /// Fails if the ledger is corrupt or a swap file the ledger references is
    /// missing or damaged.
    pub fn open(config: RepositoryConfig) -> SessionResult<Self> {
        config.validate()?;
        let started = Instant::now();
        info!(data_dir = %config.data_dir.display(), "opening flow repository");

        let content = Arc::new(ContentStore::open(&config.content, &config.content_dir())?);
        let ledger = Arc::new(WriteAheadLedger::open(&config.ledger, &config.ledger_dir())?);
        let recovered = ledger.recover()?;
        let swap = Arc::new(SwapManager::open(&config.swap_dir())?);
        let recorder: Arc<dyn SwapRecorder> = Arc::new(LedgerSwapRecorder::new(Arc::clone(&ledger)));

        let mut queues: BTreeMap<ConnectionId, Arc<ConnectionQueue>> = BTreeMap::new();
        for connection in &config.connections {
            queues.insert(
                connection.id.clone(),
                Arc::new(build_queue(connection, &config.queue_defaults, &swap, &recorder)),
            );
        }
        for id in recovered.flowfiles.keys().chain(recovered.swap_locations.keys()) {
            if !queues.contains_key(id) {
                warn!(connection = %id, "recovered FlowFiles for an unconfigured connection, using default settings");
                let connection = ConnectionConfig::new(id.clone());
                queues.insert(
                    id.clone(),
                    Arc::new(build_queue(&connection, &config.queue_defaults, &swap, &recorder)),
                );
            }
        }

        let mut claim_counts: HashMap<ContentClaim, u64> = recovered.claim_counts;
        let mut known_swap = HashSet::new();
        let mut swapped: BTreeMap<ConnectionId, Vec<SwapSummary>> = BTreeMap::new();
        for (id, locations) in &recovered.swap_locations {
            let queue = queues
                .get(id)
                .ok_or_else(|| SessionError::UnknownConnection(id.clone()))?;
            for location in locations {
                let records = swap.read(location).map_err(|e| {
                    error!(connection = %id, location = %location, error = %e, "swap file referenced by the ledger is unusable");
                    e
                })?;
                for claim in records.iter().filter_map(|r| r.claim) {
                    *claim_counts.entry(claim).or_insert(0) += 1;
                }
                if let Some(summary) = SwapSummary::from_records(location, &records, queue.order()) {
                    swapped.entry(id.clone()).or_default().push(summary);
                }
                known_swap.insert(location.clone());
            }
        }

        content.restore_counts(claim_counts);
        let orphan_containers = content.remove_orphans()?;
        let orphan_swap_files = swap.remove_orphans(&known_swap)?;

        let mut active = recovered.flowfiles;
        for (id, queue) in &queues {
            let records = active.remove(id).unwrap_or_default();
            let summaries = swapped.remove(id).unwrap_or_default();
            if !records.is_empty() || !summaries.is_empty() {
                queue.restore(records, summaries);
            }
        }

        log_recovery(&recovered.report, orphan_containers, orphan_swap_files, started);
        let inner = RepositoryInner {
            config,
            content,
            ledger,
            swap,
            recorder,
            queues: RwLock::new(queues),
            next_flowfile_id: AtomicU64::new(recovered.next_flowfile_id),
            next_queue_index: AtomicU64::new(recovered.next_queue_index),
            sessions_committed: AtomicU64::new(0),
            sessions_rolled_back: AtomicU64::new(0),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Configuration the repository was opened with.
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// The content store.
    pub fn content(&self) -> &ContentStore {
        &self.inner.content
    }

    /// The ledger.
    pub fn ledger(&self) -> &WriteAheadLedger {
        &self.inner.ledger
    }

    /// Adds a connection at runtime. Returns the existing queue if the id is taken.
    pub fn register_connection(&self, connection: ConnectionConfig) -> Arc<ConnectionQueue> {
        let mut queues = self.inner.queues.write();
        let queue = queues
            .entry(connection.id.clone())
            .or_insert_with(|| {
                info!(connection = %connection.id, "registered connection");
                Arc::new(self.inner.build_queue(&connection))
            });
        Arc::clone(queue)
    }

    /// The queue of a connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionQueue>> {
        self.inner.queues.read().get(id).cloned()
    }

    /// Ids of every known connection.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.queues.read().keys().cloned().collect()
    }

    /// Starts a new session.
    pub fn session(&self) -> StandardProcessSession {
        StandardProcessSession::new(Arc::clone(&self.inner))
    }

    /// Writes a ledger snapshot.
    pub fn checkpoint(&self) -> SessionResult<CheckpointStats> {
        Ok(self.inner.ledger.checkpoint()?)
    }

    /// Deletes containers no FlowFile references any more.
    pub fn reclaim(&self) -> ReclaimStats {
        self.inner.content.reclaim()
    }

    /// Removes every FlowFile queued on `id`, swapped ones included.
    ///
    /// Runs as an ordinary session, so the deletes are durable and the
    /// content references are released. Returns the number of FlowFiles dropped.
    pub fn drop_flowfiles(&self, id: &ConnectionId) -> SessionResult<usize> {
        let mut session = self.session();
        let records = session.take_all(id)?;
        for record in &records {
            session.remove(record)?;
        }
        let summary = session.commit()?;
        info!(connection = %id, dropped = summary.removed, "dropped FlowFiles");
        Ok(records.len())
    }

    /// Seals open containers and writes a final checkpoint.
    pub fn shutdown(&self) -> SessionResult<CheckpointStats> {
        info!("shutting down flow repository");
        self.inner.content.close()?;
        let stats = self.inner.ledger.checkpoint()?;
        info!(live_flowfiles = stats.live_flowfiles, "flow repository shut down");
        Ok(stats)
    }

    /// Snapshot of queue sizes and counters.
    pub fn status(&self) -> RepositoryStatus {
        let connections = self
            .inner
            .queues
            .read()
            .iter()
            .map(|(id, q)| (id.clone(), q.size()))
            .collect();
        RepositoryStatus {
            connections,
            content: self.inner.content.stats(),
            ledger: self.inner.ledger.stats(),
            sessions_committed: self.inner.sessions_committed.load(Ordering::Relaxed),
            sessions_rolled_back: self.inner.sessions_rolled_back.load(Ordering::Relaxed),
        }
    }
}

fn log_recovery(report: &RecoveryReport, orphan_containers: usize, orphan_swap_files: usize, started: Instant) {
    info!(
        live_flowfiles = report.live_flowfiles,
        swap_files = report.swap_locations,
        records_replayed = report.records_replayed,
        torn_tails = report.torn_tails_truncated,
        orphan_containers,
        orphan_swap_files,
        duration_ms = started.elapsed().as_millis() as u64,
        "flow repository recovered"
    );
}

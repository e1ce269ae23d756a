//! Background maintenance: periodic ledger checkpoints and container
//! reclamation, plus the final checkpoint on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use flowrepo_ledger::{CheckpointStats, LedgerError};

use crate::error::{SessionError, SessionResult};
use crate::repository::FlowRepository;

/// Counters of the maintenance worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Periodic checkpoints completed.
    pub checkpoints: u64,
    /// Periodic checkpoints that failed.
    pub checkpoint_failures: u64,
    /// Reclamation passes run.
    pub reclaim_runs: u64,
    /// Containers deleted across all passes.
    pub containers_reclaimed: u64,
    /// Bytes freed across all passes.
    pub bytes_reclaimed: u64,
}

/// Handle to the running maintenance worker.
pub struct MaintenanceTasks {
    repo: FlowRepository,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<watch::Receiver<MaintenanceStats>>,
    task: JoinHandle<()>,
}

impl MaintenanceTasks {
    /// Starts the worker on the current tokio runtime, using the intervals
    /// from the repository configuration.
    pub fn start(repo: FlowRepository) -> Self {
        let checkpoint_every = repo.config().ledger.checkpoint_interval();
        let reclaim_every = repo.config().content.reclaim_interval();
        Self::start_with(repo, checkpoint_every, reclaim_every)
    }

    /// Starts the worker with explicit intervals.
    pub fn start_with(repo: FlowRepository, checkpoint_every: Duration, reclaim_every: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(MaintenanceStats::default());
        let worker = MaintenanceWorker {
            repo: repo.clone(),
            stats_tx,
            stats: MaintenanceStats::default(),
        };
        let task = tokio::spawn(worker.run(checkpoint_every, reclaim_every, shutdown_rx));
        info!(
            checkpoint_ms = checkpoint_every.as_millis() as u64,
            reclaim_ms = reclaim_every.as_millis() as u64,
            "maintenance started"
        );
        Self {
            repo,
            shutdown_tx,
            stats: Arc::new(stats_rx),
            task,
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MaintenanceStats {
        self.stats.borrow().clone()
    }

    /// Stops the worker, then seals content and writes the final checkpoint.
    pub async fn shutdown(self) -> SessionResult<CheckpointStats> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "maintenance task ended abnormally");
        }
        let repo = self.repo;
        tokio::task::spawn_blocking(move || repo.shutdown())
            .await
            .map_err(|e| SessionError::Ledger(LedgerError::Io(std::io::Error::other(e.to_string()))))?
    }
}

struct MaintenanceWorker {
    repo: FlowRepository,
    stats_tx: watch::Sender<MaintenanceStats>,
    stats: MaintenanceStats,
}

fn ticker(every: Duration) -> Interval {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl MaintenanceWorker {
    async fn run(mut self, checkpoint_every: Duration, reclaim_every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut checkpoints = ticker(checkpoint_every);
        let mut reclaims = ticker(reclaim_every);
        // Both intervals fire immediately; skip that first tick.
        checkpoints.tick().await;
        reclaims.tick().await;

        loop {
            tokio::select! {
                _ = checkpoints.tick() => self.checkpoint().await,
                _ = reclaims.tick() => self.reclaim().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            let _ = self.stats_tx.send(self.stats.clone());
        }
        debug!("maintenance worker stopped");
    }

    async fn checkpoint(&mut self) {
        let repo = self.repo.clone();
        match tokio::task::spawn_blocking(move || repo.checkpoint()).await {
            Ok(Ok(stats)) => {
                self.stats.checkpoints += 1;
                debug!(generation = stats.generation, live = stats.live_flowfiles, "periodic checkpoint");
            }
            Ok(Err(e)) => {
                self.stats.checkpoint_failures += 1;
                warn!(error = %e, "periodic checkpoint failed");
            }
            Err(e) => {
                self.stats.checkpoint_failures += 1;
                error!(error = %e, "checkpoint task panicked");
            }
        }
    }

    async fn reclaim(&mut self) {
        let repo = self.repo.clone();
        match tokio::task::spawn_blocking(move || repo.reclaim()).await {
            Ok(stats) => {
                self.stats.reclaim_runs += 1;
                self.stats.containers_reclaimed += stats.containers_reclaimed as u64;
                self.stats.bytes_reclaimed += stats.bytes_reclaimed;
            }
            Err(e) => error!(error = %e, "reclaim task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ProcessSession;
    use flowrepo_core::{ConnectionConfig, ConnectionId, RepositoryConfig};
    use tempfile::TempDir;

    fn repo(dir: &TempDir) -> FlowRepository {
        let mut config = RepositoryConfig::with_data_dir(dir.path());
        config.content.reclaim_grace_period_ms = 0;
        config.connections.push(ConnectionConfig::new("q"));
        FlowRepository::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_periodic_checkpoint_and_reclaim() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let tasks = MaintenanceTasks::start_with(
            repo.clone(),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = tasks.stats();
        assert!(stats.checkpoints >= 1);
        assert!(stats.reclaim_runs >= 1);
        assert_eq!(stats.checkpoint_failures, 0);
        tasks.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_checkpoint() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        session.transfer(&ff, &ConnectionId::new("q")).unwrap();
        session.commit().unwrap();

        let tasks = MaintenanceTasks::start_with(
            repo.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let stats = tasks.shutdown().await.unwrap();
        assert_eq!(stats.live_flowfiles, 1);
        assert!(dir.path().join("ledger").join("snapshot").exists());
    }
}

//! Running processing stages against the repository.
//!
//! A [`StageRunner`] gives its stage a fresh session per trigger and checks
//! that the stage ended it. A [`WorkerPool`] drives runners from blocking
//! worker threads; each session lives and dies on the thread that made it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowrepo_core::{ConfigError, ConnectionId, RepositoryConfig};
use flowrepo_queue::FlowFileQueue;

use crate::repository::FlowRepository;
use crate::session::{ProcessSession, SessionState};

/// Error a stage reports from [`Stage::on_trigger`].
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of processing logic.
///
/// Each trigger must end the session it is given, by commit or rollback.
pub trait Stage: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Connections the stage transfers to. The stage is not triggered while
    /// any of them is full.
    fn outbound(&self) -> Vec<ConnectionId> {
        Vec::new()
    }

    /// Does one round of work inside `session`.
    fn on_trigger(&self, session: &mut dyn ProcessSession) -> Result<(), StageError>;
}

/// Runner settings, read from the configuration's extension map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Penalty applied to FlowFiles returned after a failed trigger.
    pub penalty: Duration,
    /// Protocol violations tolerated before the stage is disabled.
    pub max_violations: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            penalty: Duration::from_secs(30),
            max_violations: 3,
        }
    }
}

impl RunnerSettings {
    /// Reads `stage.penalty_ms` and `stage.max_violations`, falling back to defaults.
    pub fn from_config(config: &RepositoryConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            penalty: config
                .extension::<u64>("stage.penalty_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.penalty),
            max_violations: config
                .extension::<u32>("stage.max_violations")?
                .unwrap_or(defaults.max_violations),
        })
    }
}

/// Result of one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The stage committed its session.
    Committed,
    /// The stage rolled its session back.
    RolledBack,
    /// The stage returned an error; its session was rolled back with penalty.
    Failed,
    /// The stage left its session open; it was rolled back with penalty.
    Violation,
    /// An outbound connection is full; the stage was not triggered.
    BackPressure,
    /// The stage is disabled.
    Disabled,
}

/// Counters of one runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Times the stage ran.
    pub triggers: u64,
    /// Sessions the stage committed.
    pub commits: u64,
    /// Sessions rolled back, by the stage or by the runner.
    pub rollbacks: u64,
    /// Triggers that returned an error.
    pub failures: u64,
    /// Triggers that left the session open.
    pub violations: u64,
    /// Triggers skipped for back-pressure.
    pub backpressure_skips: u64,
}

/// Drives one stage.
pub struct StageRunner {
    repo: FlowRepository,
    stage: Arc<dyn Stage>,
    settings: RunnerSettings,
    disabled: AtomicBool,
    consecutive_violations: AtomicU32,
    triggers: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    failures: AtomicU64,
    violations: AtomicU64,
    backpressure_skips: AtomicU64,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage", &self.stage.name())
            .field("settings", &self.settings)
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Runner for `stage` against `repo`.
    pub fn new(repo: FlowRepository, stage: Arc<dyn Stage>, settings: RunnerSettings) -> Self {
        Self {
            repo,
            stage,
            settings,
            disabled: AtomicBool::new(false),
            consecutive_violations: AtomicU32::new(0),
            triggers: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            backpressure_skips: AtomicU64::new(0),
        }
    }

    /// Name of the stage.
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// True once the stage was disabled for protocol violations.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Re-enables a disabled stage.
    pub fn enable(&self) {
        self.consecutive_violations.store(0, Ordering::Relaxed);
        self.disabled.store(false, Ordering::Release);
        info!(stage = self.name(), "stage enabled");
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            triggers: self.triggers.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            backpressure_skips: self.backpressure_skips.load(Ordering::Relaxed),
        }
    }

    fn outbound_full(&self) -> bool {
        for id in self.stage.outbound() {
            match self.repo.connection(&id) {
                Some(queue) if queue.is_full() => {
                    debug!(stage = self.name(), connection = %id, "outbound connection full");
                    return true;
                }
                Some(_) => {}
                None => warn!(stage = self.name(), connection = %id, "stage routes to an unknown connection"),
            }
        }
        false
    }

    /// Runs the stage once in a new session.
    pub fn trigger(&self) -> TriggerOutcome {
        if self.is_disabled() {
            return TriggerOutcome::Disabled;
        }
        if self.outbound_full() {
            self.backpressure_skips.fetch_add(1, Ordering::Relaxed);
            return TriggerOutcome::BackPressure;
        }

        self.triggers.fetch_add(1, Ordering::Relaxed);
        let mut session = self.repo.session();
        let result = self.stage.on_trigger(&mut session);
        let state = session.state();

        match result {
            Ok(()) => match state {
                SessionState::Committed => {
                    self.commits.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_violations.store(0, Ordering::Relaxed);
                    TriggerOutcome::Committed
                }
                SessionState::RolledBack => {
                    self.rollbacks.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_violations.store(0, Ordering::Relaxed);
                    TriggerOutcome::RolledBack
                }
                _ => {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                    let count = self.consecutive_violations.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(stage = self.name(), violations = count, "stage neither committed nor rolled back");
                    self.penalize(&mut session);
                    if count >= self.settings.max_violations {
                        self.disabled.store(true, Ordering::Release);
                        error!(stage = self.name(), violations = count, "stage disabled");
                    }
                    TriggerOutcome::Violation
                }
            },
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(stage = self.name(), error = %e, "stage failed");
                if state == SessionState::Open {
                    self.penalize(&mut session);
                } else if state == SessionState::RolledBack {
                    self.rollbacks.fetch_add(1, Ordering::Relaxed);
                }
                TriggerOutcome::Failed
            }
        }
    }

    fn penalize(&self, session: &mut dyn ProcessSession) {
        match session.rollback_with_penalty(self.settings.penalty) {
            Ok(()) => {
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(stage = self.name(), error = %e, "rollback failed"),
        }
    }
}

/// Blocking worker threads triggering a set of stage runners.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` threads on the current tokio runtime.
    ///
    /// Every worker cycles through all runners; a worker that finds nothing
    /// committed in a full pass sleeps for `idle_wait`.
    pub fn start(runners: Vec<Arc<StageRunner>>, workers: usize, idle_wait: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runners = Arc::new(runners);
        let count = workers.max(1);
        let workers = (0..count)
            .map(|worker| {
                let runners = Arc::clone(&runners);
                let shutdown = shutdown_rx.clone();
                tokio::task::spawn_blocking(move || run_worker(worker, &runners, shutdown, idle_wait))
            })
            .collect();
        info!(workers = count, stages = runners.len(), "worker pool started");
        Self {
            shutdown_tx,
            workers,
        }
    }

    /// Signals every worker and waits for them to finish their current pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

fn run_worker(worker: usize, runners: &[Arc<StageRunner>], shutdown: watch::Receiver<bool>, idle_wait: Duration) {
    debug!(worker, "worker started");
    let n = runners.len();
    let mut start = worker;
    while n > 0 && !*shutdown.borrow() {
        let mut busy = false;
        for i in 0..n {
            if runners[(start + i) % n].trigger() == TriggerOutcome::Committed {
                busy = true;
            }
        }
        start = start.wrapping_add(1);
        if !busy {
            std::thread::sleep(idle_wait);
        }
    }
    debug!(worker, "worker stopped");
}

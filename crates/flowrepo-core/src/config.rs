//! Repository configuration.
//!
//! All options are statically enumerated; free-form settings go into the
//! `extensions` map and are read back with [`RepositoryConfig::extension`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::ConnectionId;

/// Content store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// A writable container is sealed once it reaches this many bytes (default 1MB).
    pub max_container_size: u64,
    /// Number of section sub-directories containers are spread over (default 16).
    pub section_count: u32,
    /// How long a container must stay unreferenced before it is deleted (default 60s).
    pub reclaim_grace_period_ms: u64,
    /// Interval between background reclamation passes (default 10s).
    pub reclaim_interval_ms: u64,
    /// fsync every content write instead of once per session commit.
    pub always_sync: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            max_container_size: 1024 * 1024, // 1MB
            section_count: 16,
            reclaim_grace_period_ms: 60_000,
            reclaim_interval_ms: 10_000,
            always_sync: false,
        }
    }
}

impl ContentConfig {
    /// Grace period as a [`Duration`].
    pub fn reclaim_grace_period(&self) -> Duration {
        Duration::from_millis(self.reclaim_grace_period_ms)
    }

    /// Reclamation interval as a [`Duration`].
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

/// Sync mode for ledger persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncMode {
    /// fsync after every batch; a commit is durable when it returns.
    #[default]
    Sync,
    /// Leave flushing to the OS (fastest, recent commits may be lost on power failure).
    AsyncSync,
}

/// FlowFile ledger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Number of partition logs batches are spread over (default 16).
    pub partitions: usize,
    /// Interval between checkpoints (default 2 minutes).
    pub checkpoint_interval_ms: u64,
    /// Sync strategy for ledger appends.
    pub sync_mode: SyncMode,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            partitions: 16,
            checkpoint_interval_ms: 120_000,
            sync_mode: SyncMode::Sync,
        }
    }
}

impl LedgerConfig {
    /// Checkpoint interval as a [`Duration`].
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Ordering policies a connection can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrioritizerKind {
    /// Order by enqueue index.
    FirstInFirstOut,
    /// Oldest lineage first.
    OldestFlowFileFirst,
    /// Newest lineage first.
    NewestFlowFileFirst,
    /// Order by the `priority` attribute.
    PriorityAttribute,
}

/// Effective queue settings for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Back-pressure object count threshold (default 10,000).
    pub backpressure_object_threshold: u64,
    /// Back-pressure data size threshold in bytes (default 1GB).
    pub backpressure_data_size_threshold: u64,
    /// Active record count above which records are swapped to disk (default 20,000).
    pub swap_threshold: usize,
    /// Records written per swap file (default 10,000).
    pub swap_batch_size: usize,
    /// Hard ceiling on queued records; enqueue beyond it fails with QueueFull.
    pub hard_object_limit: Option<u64>,
    /// Hard ceiling on queued bytes; enqueue beyond it fails with QueueFull.
    pub hard_data_size_limit: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backpressure_object_threshold: 10_000,
            backpressure_data_size_threshold: 1024 * 1024 * 1024, // 1GB
            swap_threshold: 20_000,
            swap_batch_size: 10_000,
            hard_object_limit: None,
            hard_data_size_limit: None,
        }
    }
}

/// Per-connection overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection id.
    pub id: ConnectionId,
    /// Overrides [`QueueSettings::backpressure_object_threshold`].
    #[serde(default)]
    pub backpressure_object_threshold: Option<u64>,
    /// Overrides [`QueueSettings::backpressure_data_size_threshold`].
    #[serde(default)]
    pub backpressure_data_size_threshold: Option<u64>,
    /// Overrides [`QueueSettings::swap_threshold`].
    #[serde(default)]
    pub swap_threshold: Option<usize>,
    /// Overrides [`QueueSettings::hard_object_limit`].
    #[serde(default)]
    pub hard_object_limit: Option<u64>,
    /// Overrides [`QueueSettings::hard_data_size_limit`].
    #[serde(default)]
    pub hard_data_size_limit: Option<u64>,
    /// Ordering policy chain; empty means first-in-first-out.
    #[serde(default)]
    pub prioritizers: Vec<PrioritizerKind>,
}

impl ConnectionConfig {
    /// A connection with no overrides.
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            backpressure_object_threshold: None,
            backpressure_data_size_threshold: None,
            swap_threshold: None,
            hard_object_limit: None,
            hard_data_size_limit: None,
            prioritizers: Vec::new(),
        }
    }

    /// Applies the overrides to `defaults`.
    pub fn settings(&self, defaults: &QueueSettings) -> QueueSettings {
        QueueSettings {
            backpressure_object_threshold: self
                .backpressure_object_threshold
                .unwrap_or(defaults.backpressure_object_threshold),
            backpressure_data_size_threshold: self
                .backpressure_data_size_threshold
                .unwrap_or(defaults.backpressure_data_size_threshold),
            swap_threshold: self.swap_threshold.unwrap_or(defaults.swap_threshold),
            swap_batch_size: defaults.swap_batch_size,
            hard_object_limit: self.hard_object_limit.or(defaults.hard_object_limit),
            hard_data_size_limit: self.hard_data_size_limit.or(defaults.hard_data_size_limit),
        }
    }
}

/// Top-level repository configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root directory for content, ledger and swap files.
    pub data_dir: PathBuf,
    /// Content store settings.
    pub content: ContentConfig,
    /// Ledger settings.
    pub ledger: LedgerConfig,
    /// Settings applied to connections without overrides.
    pub queue_defaults: QueueSettings,
    /// Connections created at startup.
    pub connections: Vec<ConnectionConfig>,
    /// Free-form settings for collaborators outside the core.
    pub extensions: BTreeMap<String, String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/flowrepo"),
            content: ContentConfig::default(),
            ledger: LedgerConfig::default(),
            queue_defaults: QueueSettings::default(),
            connections: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }
}

impl RepositoryConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML or JSON configuration, chosen by file extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RepositoryConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the repository cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.content.max_container_size == 0 {
            return Err(invalid("content.max_container_size", "must be greater than 0"));
        }
        if self.content.section_count == 0 {
            return Err(invalid("content.section_count", "must be at least 1"));
        }
        if self.ledger.partitions == 0 {
            return Err(invalid("ledger.partitions", "must be at least 1"));
        }
        if self.queue_defaults.swap_batch_size == 0 {
            return Err(invalid("queue_defaults.swap_batch_size", "must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if conn.id.as_str().is_empty() {
                return Err(invalid("connections.id", "must not be empty"));
            }
            if !seen.insert(conn.id.clone()) {
                return Err(invalid("connections.id", &format!("duplicate id '{}'", conn.id)));
            }
            let settings = conn.settings(&self.queue_defaults);
            if settings.swap_threshold < settings.swap_batch_size {
                return Err(invalid(
                    &format!("connections[{}].swap_threshold", conn.id),
                    "must not be smaller than swap_batch_size",
                ));
            }
        }
        if self.queue_defaults.swap_threshold < self.queue_defaults.swap_batch_size {
            return Err(invalid(
                "queue_defaults.swap_threshold",
                "must not be smaller than swap_batch_size",
            ));
        }
        Ok(())
    }

    /// Reads a typed value from the extension map.
    pub fn extension<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.extensions.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
                field: format!("extensions.{}", key),
                reason: e.to_string(),
            }),
        }
    }

    /// Directory holding content containers.
    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    /// Directory holding ledger partitions and snapshots.
    pub fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    /// Directory holding swap files.
    pub fn swap_dir(&self) -> PathBuf {
        self.data_dir.join("swap")
    }
}

//! Grid configuration.
//!
//! All sections deserialize with defaults so a config file only needs to
//! mention what it overrides. Durations are written as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::MAX_REPLICA_COUNT;

/// Default number of partitions in a new cluster.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Top-level configuration for one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Number of partitions. Fixed for the lifetime of the cluster.
    pub partition_count: u32,
    /// Number of backup replicas per partition (replica count is this + 1).
    pub backup_count: usize,
    pub executor: ExecutorConfig,
    pub migration: MigrationConfig,
    pub replica_sync: ReplicaSyncConfig,
    pub invocation: InvocationConfig,
    pub parker: ParkerConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: 1,
            executor: ExecutorConfig::default(),
            migration: MigrationConfig::default(),
            replica_sync: ReplicaSyncConfig::default(),
            invocation: InvocationConfig::default(),
            parker: ParkerConfig::default(),
        }
    }
}

impl GridConfig {
    /// Config with the given partition count and defaults elsewhere.
    pub fn with_partition_count(partition_count: u32) -> Self {
        Self {
            partition_count,
            ..Self::default()
        }
    }

    /// Total replicas per partition, owner included.
    pub fn replica_count(&self) -> usize {
        self.backup_count + 1
    }

    /// Checks value ranges. Called by every component constructor that
    /// consumes the config.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::Configuration("partition_count must be > 0".into()));
        }
        if self.backup_count >= MAX_REPLICA_COUNT {
            return Err(Error::Configuration(format!(
                "backup_count must be < {MAX_REPLICA_COUNT}, got {}",
                self.backup_count
            )));
        }
        if self.executor.partition_threads == 0 {
            return Err(Error::Configuration(
                "executor.partition_threads must be > 0".into(),
            ));
        }
        if self.migration.parallelism == 0 {
            return Err(Error::Configuration(
                "migration.parallelism must be > 0".into(),
            ));
        }
        if self.migration.copy_attempts == 0 {
            return Err(Error::Configuration(
                "migration.copy_attempts must be > 0".into(),
            ));
        }
        if self.replica_sync.base_delay > self.replica_sync.max_delay {
            return Err(Error::Configuration(
                "replica_sync.base_delay must not exceed max_delay".into(),
            ));
        }
        if self.replica_sync.parallelism == 0 {
            return Err(Error::Configuration(
                "replica_sync.parallelism must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }
}

/// Actor-per-partition executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads; partition `p` runs on thread `p % partition_threads`.
    pub partition_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            partition_threads: threads,
        }
    }
}

/// Migration execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Migrations executing at once (always on distinct partitions).
    pub parallelism: usize,
    /// Attempts at copying replica data before the migration fails.
    pub copy_attempts: u32,
    /// Pause between copy attempts.
    #[serde(with = "millis")]
    pub copy_retry_delay: Duration,
    /// Also report backup-replica migrations to listeners.
    pub notify_backup_migrations: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            copy_attempts: 3,
            copy_retry_delay: Duration::from_millis(50),
            notify_backup_migrations: false,
        }
    }
}

/// Anti-entropy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSyncConfig {
    /// Delay before the first attempt; doubles per retry.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound for the backoff delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Sync requests in flight at once.
    pub parallelism: usize,
}

impl Default for ReplicaSyncConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            parallelism: 4,
        }
    }
}

/// Invocation retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Resends allowed before an invocation fails with a timeout.
    pub retry_budget: u32,
    /// Pause before a resend.
    #[serde(with = "millis")]
    pub retry_pause: Duration,
    /// Default deadline for a call, blocking waits included.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            retry_budget: 100,
            retry_pause: Duration::from_millis(50),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Wait-notify settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkerConfig {
    /// How often parked entries are checked for expiry.
    #[serde(with = "millis")]
    pub expiry_scan_interval: Duration,
}

impl Default for ParkerConfig {
    fn default() -> Self {
        Self {
            expiry_scan_interval: Duration::from_millis(100),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

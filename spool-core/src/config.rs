use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolError};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Uploads allowed in flight at once.
    pub concurrency: usize,
    /// Per-attempt timeout; an expired attempt counts as a failure.
    pub task_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Completed uploads kept for the rolling throughput average.
    pub throughput_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            task_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            throughput_window: 10,
        }
    }
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshots older than this are expired and never returned.
    pub max_age_secs: u64,
    /// Interruptions younger than this recover without asking the user.
    pub auto_recovery_secs: u64,
    /// File name of the single persisted slot inside the state directory.
    pub storage_key: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 60 * 60,
            auto_recovery_secs: 5 * 60,
            storage_key: "active-session.json".into(),
        }
    }
}

impl SnapshotConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn auto_recovery_threshold(&self) -> Duration {
        Duration::from_secs(self.auto_recovery_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Minimum spacing between progress-driven snapshot writes.
    pub snapshot_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 2000,
        }
    }
}

impl ControllerConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub queue: QueueConfig,
    pub snapshot: SnapshotConfig,
    pub controller: ControllerConfig,
}

impl SpoolConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: SpoolConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency == 0 {
            return Err(SpoolError::Config("queue.concurrency must be at least 1".into()));
        }
        if self.queue.task_timeout_ms == 0 {
            return Err(SpoolError::Config("queue.task_timeout_ms must be positive".into()));
        }
        let retry = &self.queue.retry;
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(SpoolError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }
        if self.snapshot.storage_key.is_empty()
            || self.snapshot.storage_key.contains(['/', '\\'])
        {
            return Err(SpoolError::Config(format!(
                "snapshot.storage_key must be a plain file name, got {:?}",
                self.snapshot.storage_key
            )));
        }
        if self.snapshot.auto_recovery_secs > self.snapshot.max_age_secs {
            return Err(SpoolError::Config(
                "snapshot.auto_recovery_secs exceeds snapshot.max_age_secs".into(),
            ));
        }
        Ok(())
    }
}

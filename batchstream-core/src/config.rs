//! Driver configuration, built in code or read from `BATCHSTREAM_*` environment variables
use std::{path::PathBuf, str::FromStr, time::Duration};

use bon::Builder;
use envconfig::Envconfig;
use thiserror::Error;

use crate::{
    checkpoint::{Checkpointer, EveryNWindows, FilePersistence, NoCheckpoints},
    state::UpdateScope,
};

/// What to do when the latest checkpoint can not be decoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Refuse to start. The checkpoint needs manual intervention.
    #[default]
    Fail,
    /// Discard the checkpoint and start with empty state. Choosing this mode is the operator's
    /// confirmation that losing the state is acceptable.
    StartEmpty,
}

/// Settings of a [crate::driver::Driver]
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use batchstream::config::DriverConfig;
///
/// let config = DriverConfig::builder()
///     .batch_interval(Duration::from_millis(500))
///     .partitions(4)
///     .build();
/// assert_eq!(config.partitions, 4);
/// assert_eq!(config.retry_backoff, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Builder)]
pub struct DriverConfig {
    /// Length of a window
    #[builder(default = Duration::from_secs(1))]
    pub batch_interval: Duration,
    /// Wait between two records emitted by the source
    #[builder(default = Duration::ZERO)]
    pub source_pace: Duration,
    /// Number of hash partitions of the state store
    #[builder(default = 1)]
    pub partitions: usize,
    /// Longest wait for a state partition lock before the attempt fails
    #[builder(default = Duration::from_secs(5))]
    pub lock_timeout: Duration,
    /// Pause before retrying a window whose state update failed on a lock
    #[builder(default = Duration::from_millis(100))]
    pub retry_backoff: Duration,
    /// Handling of an undecodable checkpoint on start
    #[builder(default)]
    pub recovery: RecoveryMode,
    /// Which keys the update function sees in each window
    #[builder(default)]
    pub update_scope: UpdateScope,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A setting value that names no known mode
#[derive(Debug, Error)]
#[error("Unknown value `{value}` for {setting}")]
pub struct ParseSettingError {
    setting: &'static str,
    value: String,
}

impl FromStr for RecoveryMode {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(RecoveryMode::Fail),
            "start-empty" | "start_empty" => Ok(RecoveryMode::StartEmpty),
            _ => Err(ParseSettingError {
                setting: "recovery mode",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for UpdateScope {
    type Err = ParseSettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "touched" | "touched-keys" => Ok(UpdateScope::TouchedKeys),
            "all" | "all-keys" => Ok(UpdateScope::AllKeys),
            _ => Err(ParseSettingError {
                setting: "update scope",
                value: s.to_string(),
            }),
        }
    }
}

/// Driver and checkpoint settings read from the environment
#[derive(Envconfig)]
pub struct EnvConfig {
    /// Window length in milliseconds
    #[envconfig(from = "BATCHSTREAM_BATCH_INTERVAL_MS", default = "1000")]
    pub batch_interval_ms: u64,
    /// Wait between source records in milliseconds
    #[envconfig(from = "BATCHSTREAM_SOURCE_PACE_MS", default = "0")]
    pub source_pace_ms: u64,
    /// Number of state partitions
    #[envconfig(from = "BATCHSTREAM_PARTITIONS", default = "1")]
    pub partitions: usize,
    /// Partition lock timeout in milliseconds
    #[envconfig(from = "BATCHSTREAM_LOCK_TIMEOUT_MS", default = "5000")]
    pub lock_timeout_ms: u64,
    /// Pause before the single lock retry in milliseconds
    #[envconfig(from = "BATCHSTREAM_RETRY_BACKOFF_MS", default = "100")]
    pub retry_backoff_ms: u64,
    /// `fail` or `start-empty`
    #[envconfig(from = "BATCHSTREAM_RECOVERY", default = "fail")]
    pub recovery: RecoveryMode,
    /// `touched` or `all`
    #[envconfig(from = "BATCHSTREAM_UPDATE_SCOPE", default = "touched")]
    pub update_scope: UpdateScope,
    /// File to keep checkpoints in. Checkpointing is disabled if unset.
    #[envconfig(from = "BATCHSTREAM_CHECKPOINT_PATH")]
    pub checkpoint_path: Option<PathBuf>,
    /// Checkpoint after this many windows, `0` only recovers and never writes
    #[envconfig(from = "BATCHSTREAM_CHECKPOINT_EVERY", default = "1")]
    pub checkpoint_every: u64,
}

impl EnvConfig {
    /// Driver settings described by these variables
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig::builder()
            .batch_interval(Duration::from_millis(self.batch_interval_ms))
            .source_pace(Duration::from_millis(self.source_pace_ms))
            .partitions(self.partitions)
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .retry_backoff(Duration::from_millis(self.retry_backoff_ms))
            .recovery(self.recovery)
            .update_scope(self.update_scope)
            .build()
    }

    /// File backed checkpointer, or a disabled one if no path is set
    pub fn checkpointer(&self) -> Checkpointer {
        match (&self.checkpoint_path, self.checkpoint_every) {
            (None, _) => Checkpointer::disabled(),
            (Some(path), 0) => Checkpointer::new(FilePersistence::new(path), NoCheckpoints),
            (Some(path), n) => Checkpointer::new(FilePersistence::new(path), EveryNWindows::new(n)),
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;

const DEFAULT_CHECKPOINT_INTERVAL_IN_MS: u64 = 10_000;
const DEFAULT_MAX_PERSIST_ATTEMPTS: u16 = 5;
const DEFAULT_PERSIST_INITIAL_RETRY_INTERVAL_IN_MS: u64 = 100;
const DEFAULT_PERSIST_MAX_RETRY_INTERVAL_IN_MS: u64 = 5_000;
const DEFAULT_RETAINED_CHECKPOINTS: usize = 3;

/// A checkpoint is taken every `interval_ms` or after `record_threshold` records, whichever
/// comes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub interval_ms: u64,
    pub record_threshold: Option<u64>,
    /// Attempts to persist one checkpoint before the pipeline halts.
    pub max_persist_attempts: u16,
    pub initial_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub storage: StorageConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_CHECKPOINT_INTERVAL_IN_MS,
            record_threshold: None,
            max_persist_attempts: DEFAULT_MAX_PERSIST_ATTEMPTS,
            initial_retry_interval_ms: DEFAULT_PERSIST_INITIAL_RETRY_INTERVAL_IN_MS,
            max_retry_interval_ms: DEFAULT_PERSIST_MAX_RETRY_INTERVAL_IN_MS,
            storage: StorageConfig::default(),
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::Config("checkpoint.interval_ms must be positive".into()));
        }
        if self.record_threshold == Some(0) {
            return Err(Error::Config(
                "checkpoint.record_threshold must be positive".into(),
            ));
        }
        if self.max_persist_attempts == 0 {
            return Err(Error::Config(
                "checkpoint.max_persist_attempts must be positive".into(),
            ));
        }
        if let StorageConfig::Fs { retain, .. } = &self.storage
            && *retain == 0
        {
            return Err(Error::Config("checkpoint.storage.fs.retain must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageConfig {
    /// Lost with the process, only useful for tests and demos.
    #[default]
    Memory,
    Fs {
        path: PathBuf,
        #[serde(default = "default_retain")]
        retain: usize,
    },
}

fn default_retain() -> usize {
    DEFAULT_RETAINED_CHECKPOINTS
}

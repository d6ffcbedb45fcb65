use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;

const DEFAULT_SINK_BATCH_SIZE: usize = 500;
const DEFAULT_SINK_BATCH_TIMEOUT_IN_MS: u64 = 1000;
const DEFAULT_MAX_SINK_RETRY_ATTEMPTS: u16 = 3;
const DEFAULT_SINK_INITIAL_RETRY_INTERVAL_IN_MS: u64 = 100;
const DEFAULT_SINK_MAX_RETRY_INTERVAL_IN_MS: u64 = 10_000;
const DEFAULT_SINK_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_SINK_RETRY_JITTER: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkConfig {
    Log,
    Blackhole,
    /// Appends one JSON document per line.
    File { path: PathBuf },
}

/// Sinks per role. Only `results` is mandatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    /// Finalized window results.
    pub results: SinkConfig,
    /// Raw validated records.
    pub records: Option<SinkConfig>,
    /// Late records under `late_data_policy: side_output`.
    pub late: Option<SinkConfig>,
    /// Records failing validation.
    pub quarantine: Option<SinkConfig>,
    /// Where items end up once delivery retries are exhausted.
    pub dead_letter: Option<SinkConfig>,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            results: SinkConfig::Log,
            records: None,
            late: None,
            quarantine: None,
            dead_letter: None,
            batch_size: DEFAULT_SINK_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_SINK_BATCH_TIMEOUT_IN_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl SinksConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("sinks.batch_size must be positive".into()));
        }
        self.retry.validate()
    }
}

/// Delivery retry of a sink dispatcher. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_SINK_RETRY_ATTEMPTS,
            initial_interval_ms: DEFAULT_SINK_INITIAL_RETRY_INTERVAL_IN_MS,
            max_interval_ms: DEFAULT_SINK_MAX_RETRY_INTERVAL_IN_MS,
            factor: DEFAULT_SINK_RETRY_FACTOR,
            jitter: DEFAULT_SINK_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("sinks.retry.max_attempts must be positive".into()));
        }
        if self.factor < 1.0 || !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(
                "sinks.retry needs factor >= 1 and jitter within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

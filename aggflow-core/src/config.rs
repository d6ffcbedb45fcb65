use std::env;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;

/// Checkpoint trigger and storage settings.
pub mod checkpoint;
/// Schema of the payload.
pub mod schema;
/// Sink roles, builtin sink kinds and delivery retry.
pub mod sink;
/// Builtin source kinds.
pub mod source;
/// Windowing strategy, late data policy and aggregations.
pub mod window;

pub use checkpoint::{CheckpointConfig, StorageConfig};
pub use schema::{FieldSpec, SchemaConfig};
pub use sink::{RetryConfig, SinkConfig, SinksConfig};
pub use source::{GeneratorConfig, SourceConfig};
pub use window::{AggFunction, AggregationSpec, LateDataPolicy, WindowConfig};

/// Environment variable carrying the base64 encoded JSON pipeline spec.
pub const ENV_PIPELINE_SPEC: &str = "AGGFLOW_PIPELINE_SPEC";

const DEFAULT_PIPELINE_NAME: &str = "aggflow";
const DEFAULT_READ_BATCH_SIZE: usize = 500;
const DEFAULT_READ_TIMEOUT_IN_MS: u64 = 100;
const DEFAULT_ALLOWED_LATENESS_IN_MS: u64 = 30_000;
const DEFAULT_SHARDS: usize = 4;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// The one immutable configuration of a pipeline. Built once at startup and shared by reference
/// with every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub source: SourceConfig,
    /// Max records per poll of a partition.
    pub read_batch_size: usize,
    /// How long a partition reader waits after an empty poll.
    pub read_timeout_ms: u64,
    /// Partitions without records for this long no longer hold back the global watermark.
    pub idle_timeout_ms: Option<u64>,
    pub schema: SchemaConfig,
    pub window: WindowConfig,
    pub allowed_lateness_ms: u64,
    pub late_data_policy: LateDataPolicy,
    pub aggregations: Vec<AggregationSpec>,
    /// Number of single-writer shards the grouping keys are hashed onto.
    pub shards: usize,
    pub checkpoint: CheckpointConfig,
    pub sinks: SinksConfig,
    pub metrics_port: Option<u16>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_string(),
            source: SourceConfig::default(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_IN_MS,
            idle_timeout_ms: None,
            schema: SchemaConfig::default(),
            window: WindowConfig::default(),
            allowed_lateness_ms: DEFAULT_ALLOWED_LATENESS_IN_MS,
            late_data_policy: LateDataPolicy::default(),
            aggregations: vec![AggregationSpec::count()],
            shards: DEFAULT_SHARDS,
            checkpoint: CheckpointConfig::default(),
            sinks: SinksConfig::default(),
            metrics_port: Some(DEFAULT_METRICS_PORT),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("Parsing pipeline spec: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Reading {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Loads the spec from [`ENV_PIPELINE_SPEC`].
    pub fn from_env() -> Result<Self> {
        let encoded = env::var(ENV_PIPELINE_SPEC)
            .map_err(|_| Error::Config(format!("{ENV_PIPELINE_SPEC} is not set")))?;
        Self::from_base64(&encoded)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Decoding pipeline spec: {e}")))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| Error::Config(format!("Pipeline spec is not UTF-8: {e}")))?;
        Self::from_json(&json)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size == 0 {
            return Err(Error::Config("read_batch_size must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be positive".into()));
        }
        if self.shards == 0 {
            return Err(Error::Config("shards must be positive".into()));
        }
        if self.allowed_lateness_ms > i64::MAX as u64 {
            return Err(Error::Config("allowed_lateness_ms is out of range".into()));
        }
        self.window.validate()?;
        self.schema.validate()?;
        if self.aggregations.is_empty() {
            return Err(Error::Config("at least one aggregation is required".into()));
        }
        let mut names = std::collections::BTreeSet::new();
        for aggregation in &self.aggregations {
            aggregation.validate()?;
            if !names.insert(aggregation.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate aggregation name {}",
                    aggregation.name
                )));
            }
        }
        self.checkpoint.validate()?;
        self.sinks.validate()?;
        self.source.validate()
    }

    pub fn allowed_lateness(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.allowed_lateness_ms as i64)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allowed_lateness(), TimeDelta::seconds(30));
        assert_eq!(config.late_data_policy, LateDataPolicy::Drop);
    }

    #[test]
    fn parses_a_full_spec() {
        let json = r#"{
            "name": "clicks",
            "source": {"generator": {"partitions": 2, "rpu": 10, "key_count": 3}},
            "schema": {
                "key_field": "user",
                "fields": [
                    {"name": "user", "type": "string", "required": true},
                    {"name": "amount", "type": "float"}
                ]
            },
            "window": {"sliding": {"size_ms": 60000, "stride_ms": 10000}},
            "allowed_lateness_ms": 5000,
            "late_data_policy": "side_output",
            "aggregations": [
                {"name": "n", "fn": "count"},
                {"name": "total", "fn": "sum", "field": "amount"}
            ],
            "checkpoint": {"interval_ms": 2000, "record_threshold": 1000,
                           "storage": {"fs": {"path": "/tmp/ckpt", "retain": 2}}},
            "sinks": {"results": {"file": {"path": "/tmp/out.jsonl"}},
                      "dead_letter": "log",
                      "retry": {"max_attempts": 5}}
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "clicks");
        assert_eq!(
            config.window,
            WindowConfig::Sliding {
                size_ms: 60_000,
                stride_ms: 10_000
            }
        );
        assert_eq!(config.late_data_policy, LateDataPolicy::SideOutput);
        assert_eq!(config.aggregations.len(), 2);
        assert_eq!(config.checkpoint.record_threshold, Some(1000));
        assert_eq!(config.sinks.retry.max_attempts, 5);
        assert_eq!(config.sinks.retry.factor, RetryConfig::default().factor);
        assert_eq!(config.sinks.dead_letter, Some(SinkConfig::Log));
        assert_eq!(config.read_batch_size, DEFAULT_READ_BATCH_SIZE);
    }

    #[test]
    fn decodes_base64_spec() {
        let encoded = BASE64_STANDARD.encode(r#"{"name": "from-env", "shards": 2}"#);
        let config = PipelineConfig::from_base64(&encoded).unwrap();
        assert_eq!(config.name, "from-env");
        assert_eq!(config.shards, 2);

        assert!(matches!(
            PipelineConfig::from_base64("not base64!"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_invalid_specs() {
        let config = PipelineConfig {
            shards: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = PipelineConfig {
            window: WindowConfig::Sliding {
                size_ms: 1000,
                stride_ms: 1000,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = PipelineConfig {
            aggregations: vec![AggregationSpec::count(), AggregationSpec::count()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;

const DEFAULT_GENERATOR_PARTITIONS: u32 = 1;
const DEFAULT_GENERATOR_RPU: usize = 5;
const DEFAULT_GENERATOR_DURATION_IN_MS: u64 = 1000;
const DEFAULT_GENERATOR_KEY_COUNT: u32 = 10;
const DEFAULT_GENERATOR_MAX_OUT_OF_ORDER_IN_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    Generator(GeneratorConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Generator(GeneratorConfig::default())
    }
}

impl SourceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Generator(generator) => generator.validate(),
        }
    }
}

/// Synthetic JSON events of the form `{"key": "key-N", "value": <int>, "amount": <float>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub partitions: u32,
    /// Records produced per partition every `duration_ms`.
    pub rpu: usize,
    pub duration_ms: u64,
    /// Number of distinct grouping keys.
    pub key_count: u32,
    /// Event times lag wall-clock time by up to this much, producing out-of-order records.
    pub max_out_of_order_ms: u64,
    /// Stop after this many records per partition. `None` never stops.
    pub records_per_partition: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_GENERATOR_PARTITIONS,
            rpu: DEFAULT_GENERATOR_RPU,
            duration_ms: DEFAULT_GENERATOR_DURATION_IN_MS,
            key_count: DEFAULT_GENERATOR_KEY_COUNT,
            max_out_of_order_ms: DEFAULT_GENERATOR_MAX_OUT_OF_ORDER_IN_MS,
            records_per_partition: None,
        }
    }
}

impl GeneratorConfig {
    fn validate(&self) -> Result<()> {
        if self.partitions == 0 || self.key_count == 0 || self.rpu == 0 {
            return Err(Error::Config(
                "generator needs at least one partition, key and record per unit".into(),
            ));
        }
        Ok(())
    }
}

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;

const DEFAULT_WINDOW_SIZE_IN_MS: u64 = 60_000;
const DEFAULT_COUNT_AGGREGATION: &str = "count";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowConfig {
    /// Fixed size, non-overlapping.
    Tumbling { size_ms: u64 },
    /// Fixed size, a new window every `stride_ms`.
    Sliding { size_ms: u64, stride_ms: u64 },
    /// Closed after `gap_ms` of inactivity per key.
    Session { gap_ms: u64 },
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig::Tumbling {
            size_ms: DEFAULT_WINDOW_SIZE_IN_MS,
        }
    }
}

impl WindowConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let out_of_range = |ms: u64| ms == 0 || ms > i64::MAX as u64 / 2;
        match *self {
            WindowConfig::Tumbling { size_ms } if out_of_range(size_ms) => {
                Err(Error::Config(format!("invalid tumbling window size {size_ms}ms")))
            }
            WindowConfig::Sliding { size_ms, stride_ms }
                if out_of_range(size_ms) || out_of_range(stride_ms) || stride_ms >= size_ms =>
            {
                Err(Error::Config(format!(
                    "sliding window needs 0 < stride < size, got size {size_ms}ms stride {stride_ms}ms"
                )))
            }
            WindowConfig::Session { gap_ms } if out_of_range(gap_ms) => {
                Err(Error::Config(format!("invalid session gap {gap_ms}ms")))
            }
            _ => Ok(()),
        }
    }
}

pub(crate) fn millis(ms: u64) -> TimeDelta {
    TimeDelta::milliseconds(ms as i64)
}

/// What happens to a record whose windows are all past `watermark - allowed_lateness`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateDataPolicy {
    #[default]
    Drop,
    SideOutput,
    /// Still folded in when the window is OPEN and has not been finalized yet.
    Admit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    ApproxDistinct,
}

/// One named aggregation over a payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub name: String,
    #[serde(rename = "fn")]
    pub function: AggFunction,
    /// Required by everything but `count`; `count` with a field counts records carrying it.
    #[serde(default)]
    pub field: Option<String>,
}

impl AggregationSpec {
    pub fn new(name: impl Into<String>, function: AggFunction, field: Option<&str>) -> Self {
        Self {
            name: name.into(),
            function,
            field: field.map(String::from),
        }
    }

    pub fn count() -> Self {
        Self::new(DEFAULT_COUNT_AGGREGATION, AggFunction::Count, None)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("aggregation name must not be empty".into()));
        }
        if self.function != AggFunction::Count && self.field.is_none() {
            return Err(Error::Config(format!(
                "aggregation {} needs a field",
                self.name
            )));
        }
        Ok(())
    }
}

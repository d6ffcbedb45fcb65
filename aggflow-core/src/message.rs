use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a source partition.
pub type PartitionId = u32;

/// Position of a record within its partition. Strictly increasing per partition.
pub type Offset = u64;

/// A record exactly as polled from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub event_time: DateTime<Utc>,
    pub bytes: Bytes,
}

/// A validated record. Immutable once built by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub partition: PartitionId,
    pub offset: Offset,
    pub event_time: DateTime<Utc>,
    pub ingest_time: DateTime<Utc>,
    /// Grouping key extracted from the payload.
    pub key: String,
    /// Flattened payload, nested objects joined with `.`.
    pub payload: BTreeMap<String, Value>,
}

impl Record {
    /// `"{partition}-{offset}"`, stable across replays.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.partition, self.offset)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Identifies a window. Ordered by start, then end, then grouping key so that iterating a sorted
/// set of keys yields ascending window starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub key: String,
}

impl WindowKey {
    pub fn new(key: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            key: key.into(),
        }
    }

    /// Whether `[start, end)` contains the timestamp.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}",
            self.key,
            self.start.timestamp_millis(),
            self.end.timestamp_millis()
        )
    }
}

/// Lifecycle of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    Open,
    Closing,
    Finalized,
}

/// Immutable result of a finalized window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub window: WindowKey,
    pub values: BTreeMap<String, Value>,
    pub record_count: u64,
    pub finalize_epoch: u64,
}

impl AggregateResult {
    /// `"{key}:{start_ms}-{end_ms}:{epoch}"`, stable across replays.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.window, self.finalize_epoch)
    }
}

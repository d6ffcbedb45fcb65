use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::SinkConfig;
use crate::message::{AggregateResult, Record};
use crate::validator::QuarantinedRecord;

/// A [Blackhole] sink which reads but never writes anywhere, semantic equivalent of `/dev/null`.
mod blackhole;

/// Appends one JSON document per item to a file.
mod file;

/// [log] sink prints the items through tracing.
mod log;

/// In-memory sink with failure injection, for embedding and tests.
pub mod memory;

/// Batching, retrying delivery of one sink role.
pub mod dispatcher;

pub use blackhole::BlackholeSink;
pub use file::FileSink;
pub use log::LogSink;
pub use memory::MemorySink;

/// What the sink is written for. Part of the log lines, the metric labels and dead-letter items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkRole {
    Results,
    Records,
    Late,
    Quarantine,
    DeadLetter,
}

impl SinkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkRole::Results => "results",
            SinkRole::Records => "records",
            SinkRole::Late => "late",
            SinkRole::Quarantine => "quarantine",
            SinkRole::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for SinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a sink can be handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum SinkPayload {
    Record(Record),
    Aggregate(AggregateResult),
    Late(Record),
    Quarantined(QuarantinedRecord),
}

/// An item and its idempotency key. Replays produce the same id, so a sink deduplicating on it
/// never shows a duplicate externally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkItem {
    pub id: String,
    pub payload: SinkPayload,
}

impl SinkItem {
    pub fn record(record: Record) -> Self {
        Self {
            id: record.idempotency_key(),
            payload: SinkPayload::Record(record),
        }
    }

    pub fn aggregate(result: AggregateResult) -> Self {
        Self {
            id: result.idempotency_key(),
            payload: SinkPayload::Aggregate(result),
        }
    }

    pub fn late(record: Record) -> Self {
        Self {
            id: record.idempotency_key(),
            payload: SinkPayload::Late(record),
        }
    }

    pub fn quarantined(record: QuarantinedRecord) -> Self {
        Self {
            id: record.idempotency_key(),
            payload: SinkPayload::Quarantined(record),
        }
    }
}

/// Outcome of writing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    Success,
    /// Delivery failed, the item will be retried.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub id: String,
    pub status: SinkStatus,
}

impl SinkResponse {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SinkStatus::Success,
        }
    }

    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SinkStatus::Failed(reason.into()),
        }
    }
}

/// Set of items to be implemented by a sink. A sink answers for every item of the batch and must
/// tolerate an id it has already seen.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Write the items to the sink.
    async fn write(&mut self, items: Vec<SinkItem>) -> Result<Vec<SinkResponse>>;
}

/// The sinks the pipeline can be configured with.
pub enum SinkClientType {
    Log(LogSink),
    Blackhole(BlackholeSink),
    File(FileSink),
    Memory(MemorySink),
}

impl SinkClientType {
    pub fn new(config: &SinkConfig, role: SinkRole) -> Self {
        match config {
            SinkConfig::Log => SinkClientType::Log(LogSink::new(role)),
            SinkConfig::Blackhole => SinkClientType::Blackhole(BlackholeSink),
            SinkConfig::File { path } => SinkClientType::File(FileSink::new(path.clone())),
        }
    }
}

impl From<MemorySink> for SinkClientType {
    fn from(value: MemorySink) -> Self {
        SinkClientType::Memory(value)
    }
}

impl Sink for SinkClientType {
    async fn write(&mut self, items: Vec<SinkItem>) -> Result<Vec<SinkResponse>> {
        match self {
            SinkClientType::Log(sink) => Sink::write(sink, items).await,
            SinkClientType::Blackhole(sink) => Sink::write(sink, items).await,
            SinkClientType::File(sink) => Sink::write(sink, items).await,
            SinkClientType::Memory(sink) => Sink::write(sink, items).await,
        }
    }
}

use crate::Result;
use crate::config::SourceConfig;
use crate::message::{Offset, PartitionId, RawRecord};

/// Generator is a builtin to generate data for load testing and demos.
pub mod generator;

/// An in-memory partitioned log.
pub mod memory;

pub use generator::GeneratorSource;
pub use memory::MemorySource;

/// Set of items to be implemented to become a partitioned source. Every partition is polled by
/// exactly one task, the source is shared between them.
///
/// Offsets are never committed back to the source. The committed offsets live in checkpoints and
/// the pipeline [seeks](LocalSource::seek) to them on restart.
#[trait_variant::make(Source: Send)]
#[allow(dead_code)]
pub trait LocalSource {
    /// Partitions served by this source.
    fn partitions(&self) -> Vec<PartitionId>;

    /// Up to `max_records` records of the partition in offset order. An empty result means
    /// nothing is available right now.
    async fn poll(&self, partition: PartitionId, max_records: usize) -> Result<Vec<RawRecord>>;

    /// The next poll of the partition starts at `offset`.
    async fn seek(&self, partition: PartitionId, offset: Offset) -> Result<()>;

    /// A bounded source has nothing more to return for the partition, ever.
    fn is_exhausted(&self, partition: PartitionId) -> bool;
}

/// The sources the pipeline can be configured with.
pub enum SourceType {
    Generator(GeneratorSource),
    Memory(MemorySource),
}

impl SourceType {
    pub fn new(config: &SourceConfig) -> Self {
        match config {
            SourceConfig::Generator(generator) => {
                SourceType::Generator(GeneratorSource::new(generator.clone()))
            }
        }
    }
}

impl From<MemorySource> for SourceType {
    fn from(value: MemorySource) -> Self {
        SourceType::Memory(value)
    }
}

impl Source for SourceType {
    fn partitions(&self) -> Vec<PartitionId> {
        match self {
            SourceType::Generator(source) => Source::partitions(source),
            SourceType::Memory(source) => Source::partitions(source),
        }
    }

    async fn poll(&self, partition: PartitionId, max_records: usize) -> Result<Vec<RawRecord>> {
        match self {
            SourceType::Generator(source) => Source::poll(source, partition, max_records).await,
            SourceType::Memory(source) => Source::poll(source, partition, max_records).await,
        }
    }

    async fn seek(&self, partition: PartitionId, offset: Offset) -> Result<()> {
        match self {
            SourceType::Generator(source) => Source::seek(source, partition, offset).await,
            SourceType::Memory(source) => Source::seek(source, partition, offset).await,
        }
    }

    fn is_exhausted(&self, partition: PartitionId) -> bool {
        match self {
            SourceType::Generator(source) => Source::is_exhausted(source, partition),
            SourceType::Memory(source) => Source::is_exhausted(source, partition),
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::aggregate::WindowSnapshot;
use crate::config::StorageConfig;
use crate::message::{Offset, PartitionId};
use crate::watermark::WatermarkSnapshot;

/// Versioned checkpoint files plus an atomically renamed `LATEST` pointer.
pub mod fs;

/// Checkpoint storage in memory with failure injection.
pub mod memory;

/// Drives the IDLE, SNAPSHOTTING, PERSISTING, COMMITTED cycle.
pub mod coordinator;

pub use coordinator::{CheckpointCoordinator, CheckpointPhase};
pub use fs::FsCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable snapshot of pipeline progress: the last offset folded per partition, the watermark
/// state and every window that was not finalized yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// Consumption resumes at `offset + 1`.
    pub offsets: BTreeMap<PartitionId, Offset>,
    pub watermarks: WatermarkSnapshot,
    pub windows: Vec<WindowSnapshot>,
}

impl Checkpoint {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let checkpoint: Checkpoint = serde_json::from_slice(bytes)
            .map_err(|e| Error::Checkpoint(format!("Decoding checkpoint: {e}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {}, expected {CHECKPOINT_VERSION}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}

/// Where a versioned checkpoint was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: u64,
    pub path: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Storage of checkpoints. A checkpoint becomes visible to [`LocalCheckpointStore::get_latest_committed`]
/// only through [`LocalCheckpointStore::commit_pointer`], which must be atomic. Until it returns,
/// the previously committed checkpoint stays the latest one.
#[trait_variant::make(CheckpointStore: Send)]
#[allow(dead_code)]
pub trait LocalCheckpointStore {
    /// Writes the checkpoint to a new location without making it visible.
    async fn put_versioned(&self, id: u64, bytes: Bytes) -> Result<Location>;

    /// Atomically makes the checkpoint at `location` the latest committed one.
    async fn commit_pointer(&self, location: &Location) -> Result<()>;

    /// The latest committed checkpoint, `None` on a fresh start.
    async fn get_latest_committed(&self) -> Result<Option<Bytes>>;
}

/// The checkpoint stores the pipeline can be configured with.
pub enum CheckpointStoreType {
    Fs(FsCheckpointStore),
    Memory(MemoryCheckpointStore),
}

impl CheckpointStoreType {
    pub fn new(config: &StorageConfig) -> Self {
        match config {
            StorageConfig::Memory => CheckpointStoreType::Memory(MemoryCheckpointStore::new()),
            StorageConfig::Fs { path, retain } => {
                CheckpointStoreType::Fs(FsCheckpointStore::new(path.clone(), *retain))
            }
        }
    }

    /// Loads and decodes the latest committed checkpoint.
    pub async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match CheckpointStore::get_latest_committed(self).await? {
            Some(bytes) => Checkpoint::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl From<MemoryCheckpointStore> for CheckpointStoreType {
    fn from(value: MemoryCheckpointStore) -> Self {
        CheckpointStoreType::Memory(value)
    }
}

impl CheckpointStore for CheckpointStoreType {
    async fn put_versioned(&self, id: u64, bytes: Bytes) -> Result<Location> {
        match self {
            CheckpointStoreType::Fs(store) => CheckpointStore::put_versioned(store, id, bytes).await,
            CheckpointStoreType::Memory(store) => CheckpointStore::put_versioned(store, id, bytes).await,
        }
    }

    async fn commit_pointer(&self, location: &Location) -> Result<()> {
        match self {
            CheckpointStoreType::Fs(store) => CheckpointStore::commit_pointer(store, location).await,
            CheckpointStoreType::Memory(store) => CheckpointStore::commit_pointer(store, location).await,
        }
    }

    async fn get_latest_committed(&self) -> Result<Option<Bytes>> {
        match self {
            CheckpointStoreType::Fs(store) => CheckpointStore::get_latest_committed(store).await,
            CheckpointStoreType::Memory(store) => CheckpointStore::get_latest_committed(store).await,
        }
    }
}

//! One checkpoint cycle goes IDLE, SNAPSHOTTING, PERSISTING, COMMITTED and back to IDLE.
//!
//! While SNAPSHOTTING the partition readers are paused between two records, so the offsets, the
//! watermark state and the shard windows describe exactly the same set of folded records. Shards
//! answer the snapshot request after everything queued before it, and only copy their windows,
//! so the pause lasts as long as the copy. Readers resume before any I/O. PERSISTING first waits
//! for the sinks to deliver what was emitted before the snapshot (the checkpoint no longer carries
//! those windows), then writes the checkpoint to a new version and commits the pointer. Windows
//! finalized before the snapshot are evicted once it is COMMITTED.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::Error;
use crate::Result;
use crate::backoff::retry::Retry;
use crate::backoff::strategy::Exponential;
use crate::checkpoint::{CHECKPOINT_VERSION, Checkpoint, CheckpointStore, CheckpointStoreType, Location};
use crate::config::CheckpointConfig;
use crate::metrics::pipeline_metrics;
use crate::pipeline::partition::{PartitionHandle, Progress};
use crate::shard::Shards;
use crate::sink::dispatcher::DispatcherHandle;
use crate::watermark::WatermarkTracker;

const PERSIST_RETRY_FACTOR: f64 = 2.0;
const PERSIST_RETRY_JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    Idle,
    Snapshotting,
    Persisting,
    Committed,
}

pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    store: CheckpointStoreType,
    shards: Shards,
    tracker: Arc<WatermarkTracker>,
    progress: Arc<Progress>,
    partitions: Vec<PartitionHandle>,
    dispatchers: Vec<DispatcherHandle>,
    next_id: u64,
    last_committed: Option<u64>,
    phase: CheckpointPhase,
}

impl CheckpointCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CheckpointConfig,
        store: CheckpointStoreType,
        shards: Shards,
        tracker: Arc<WatermarkTracker>,
        progress: Arc<Progress>,
        partitions: Vec<PartitionHandle>,
        dispatchers: Vec<DispatcherHandle>,
        last_committed: Option<u64>,
    ) -> Self {
        Self {
            config,
            store,
            shards,
            tracker,
            progress,
            partitions,
            dispatchers,
            next_id: last_committed.map_or(1, |id| id + 1),
            last_committed,
            phase: CheckpointPhase::Idle,
        }
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// Id of the last durable checkpoint, the one a restart resumes from.
    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    /// Runs one full cycle and returns the id of the committed checkpoint. A persist failure that
    /// outlives the retry budget is fatal.
    pub(crate) async fn checkpoint(&mut self) -> Result<u64> {
        let id = self.next_id;
        self.phase = CheckpointPhase::Snapshotting;
        let checkpoint = self.snapshot(id).await;
        let checkpoint = match checkpoint {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.phase = CheckpointPhase::Idle;
                return Err(e);
            }
        };

        self.phase = CheckpointPhase::Persisting;
        let started = Instant::now();
        for dispatcher in &self.dispatchers {
            dispatcher.flush().await?;
        }
        let bytes = checkpoint.to_bytes()?;
        let location = self.persist(id, bytes).await?;
        pipeline_metrics()
            .checkpoint_persist_time
            .observe(started.elapsed().as_micros() as f64);

        self.phase = CheckpointPhase::Committed;
        self.last_committed = Some(id);
        self.next_id = id + 1;
        pipeline_metrics().checkpoints_total.inc();
        pipeline_metrics().last_checkpoint.set(id as i64);
        info!(
            id,
            %location,
            windows = checkpoint.windows.len(),
            offsets = ?checkpoint.offsets,
            "Checkpoint committed"
        );

        self.shards.evict(id).await?;
        self.phase = CheckpointPhase::Idle;
        Ok(id)
    }

    /// Pauses the readers, captures offsets, watermarks and windows, resumes the readers.
    async fn snapshot(&self, id: u64) -> Result<Checkpoint> {
        let started = Instant::now();
        let mut resumes = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            // a reader that already finished has nothing in flight
            if let Some(resume) = partition.pause().await {
                resumes.push(resume);
            }
        }

        let offsets = self.progress.offsets();
        let watermarks = self.tracker.snapshot();
        let shards = self.shards.snapshot(id).await;
        self.progress.reset_since_checkpoint();

        for resume in resumes {
            let _ = resume.send(());
        }
        pipeline_metrics()
            .checkpoint_snapshot_time
            .observe(started.elapsed().as_micros() as f64);

        Ok(Checkpoint {
            version: CHECKPOINT_VERSION,
            id,
            created_at: Utc::now(),
            offsets,
            watermarks,
            windows: shards?.into_iter().flat_map(|s| s.windows).collect(),
        })
    }

    /// Writes and commits with an exponential backoff, giving up after `max_persist_attempts`.
    async fn persist(&self, id: u64, bytes: bytes::Bytes) -> Result<Location> {
        let delays = Exponential::from_millis(
            self.config.initial_retry_interval_ms,
            self.config.max_retry_interval_ms,
            PERSIST_RETRY_FACTOR,
            PERSIST_RETRY_JITTER,
            Some(self.config.max_persist_attempts.saturating_sub(1)),
        );
        let store = &self.store;
        let operation = || {
            let bytes = bytes.clone();
            async move {
                let location = store.put_versioned(id, bytes).await?;
                store.commit_pointer(&location).await?;
                Ok::<_, Error>(location)
            }
        };
        let condition = |e: &Error| {
            pipeline_metrics().checkpoint_failures_total.inc();
            warn!(id, ?e, "Persisting checkpoint failed");
            true
        };

        Retry::new(delays, operation, condition)
            .await
            .map_err(|e| Error::CheckpointPersist {
                reason: format!(
                    "checkpoint {id} not persisted after {} attempts: {e}",
                    self.config.max_persist_attempts
                ),
                last_committed: self.last_committed,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeDelta;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::{PipelineConfig, SinksConfig, WindowConfig};
    use crate::shared::test_utils::{record, utc};
    use crate::sink::dispatcher::SinkDispatcher;
    use crate::sink::{MemorySink, SinkRole};

    struct Fixture {
        coordinator: CheckpointCoordinator,
        store: MemoryCheckpointStore,
        results: MemorySink,
        shards: Shards,
        progress: Arc<Progress>,
    }

    fn fixture(max_persist_attempts: u16) -> Fixture {
        let config = PipelineConfig {
            window: WindowConfig::Tumbling { size_ms: 10_000 },
            allowed_lateness_ms: 0,
            shards: 2,
            ..Default::default()
        };
        let results = MemorySink::new();
        let sinks = SinksConfig {
            batch_size: 1,
            batch_timeout_ms: 10,
            ..Default::default()
        };
        let (handle, _) = SinkDispatcher::new(
            SinkRole::Results,
            results.clone().into(),
            None,
            &sinks,
        )
        .start();
        let (shards, _) = Shards::start(&config, handle.clone(), None, vec![], None);
        let tracker = Arc::new(WatermarkTracker::new(&[0], TimeDelta::zero(), None));
        let progress = Arc::new(Progress::new(None, BTreeMap::new()));
        let store = MemoryCheckpointStore::new();
        let checkpoint = CheckpointConfig {
            max_persist_attempts,
            initial_retry_interval_ms: 1,
            max_retry_interval_ms: 2,
            ..Default::default()
        };
        let coordinator = CheckpointCoordinator::new(
            checkpoint,
            store.clone().into(),
            shards.clone(),
            Arc::clone(&tracker),
            Arc::clone(&progress),
            vec![],
            vec![handle],
            None,
        );
        Fixture {
            coordinator,
            store,
            results,
            shards,
            progress,
        }
    }

    #[tokio::test]
    async fn captures_offsets_and_open_windows() {
        let mut f = fixture(3);
        for (offset, ms) in [(0, 1_000), (1, 12_000)] {
            f.shards.route(record(0, offset, "A", ms), None).await.unwrap();
            f.progress.folded(0, offset);
        }
        f.shards.advance(utc(10_000)).await.unwrap();

        let id = f.coordinator.checkpoint().await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(f.coordinator.phase(), CheckpointPhase::Idle);
        assert_eq!(f.coordinator.last_committed(), Some(1));

        let bytes = f.store.get_latest_committed().await.unwrap().unwrap();
        let checkpoint = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(checkpoint.offsets, BTreeMap::from([(0, 1)]));
        // the finalized [0, 10s) is with the sink, only [10s, 20s) is in flight
        assert_eq!(checkpoint.windows.len(), 1);
        assert_eq!(checkpoint.windows[0].window.start, utc(10_000));
        // and the sink had it before the checkpoint committed
        assert_eq!(f.results.deliveries(), vec!["A:0-10000:0"]);

        assert_eq!(f.coordinator.checkpoint().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn transient_persist_failures_are_retried() {
        let mut f = fixture(3);
        f.store.fail_next_puts(1);
        f.store.fail_next_commits(1);
        assert_eq!(f.coordinator.checkpoint().await.unwrap(), 1);
        assert_eq!(f.store.committed_id(), Some(1));
    }

    #[tokio::test]
    async fn exhausted_persist_is_fatal_and_reports_last_commit() {
        let mut f = fixture(2);
        f.coordinator.checkpoint().await.unwrap();

        f.store.fail_next_puts(2);
        let err = f.coordinator.checkpoint().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::CheckpointPersist {
                last_committed: Some(1),
                ..
            }
        ));
        // the previous checkpoint is still the one to restart from
        assert_eq!(f.store.committed_id(), Some(1));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Error;
use crate::Result;
use crate::checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointStoreType};
use crate::config::{PipelineConfig, SinkConfig};
use crate::message::{Offset, PartitionId};
use crate::metrics::pipeline_metrics;
use crate::shard::Shards;
use crate::sink::dispatcher::{DispatcherHandle, DispatcherReport, SinkDispatcher};
use crate::sink::{SinkClientType, SinkRole};
use crate::source::{Source, SourceType};
use crate::validator::Validator;
use crate::watermark::WatermarkTracker;

/// Partition readers and the coordination with checkpoints.
pub(crate) mod partition;

use partition::{PartitionReader, Progress, ReaderContext};

pub use crate::shard::ShardReport;

const COMMAND_CHANNEL_SIZE: usize = 10;

/// What a pipeline did, returned once it stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub last_checkpoint: Option<u64>,
    /// Last folded offset per partition.
    pub offsets: BTreeMap<PartitionId, Offset>,
    pub watermark: Option<DateTime<Utc>>,
    pub windows: ShardReport,
    pub sinks: Vec<DispatcherReport>,
}

/// Sinks overriding the configured ones, e.g. in-memory sinks when embedding the engine.
#[derive(Default)]
struct SinkOverrides {
    results: Option<SinkClientType>,
    records: Option<SinkClientType>,
    late: Option<SinkClientType>,
    quarantine: Option<SinkClientType>,
    dead_letter: Option<SinkClientType>,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    source: SourceType,
    store: Option<CheckpointStoreType>,
    sinks: SinkOverrides,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig, source: impl Into<SourceType>) -> Self {
        Self {
            config,
            source: source.into(),
            store: None,
            sinks: SinkOverrides::default(),
        }
    }

    /// Source, checkpoint storage and sinks all as configured.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let source = SourceType::new(&config.source);
        Ok(Self::new(config, source))
    }

    pub fn checkpoint_store(mut self, store: impl Into<CheckpointStoreType>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn results_sink(mut self, sink: impl Into<SinkClientType>) -> Self {
        self.sinks.results = Some(sink.into());
        self
    }

    pub fn records_sink(mut self, sink: impl Into<SinkClientType>) -> Self {
        self.sinks.records = Some(sink.into());
        self
    }

    pub fn late_sink(mut self, sink: impl Into<SinkClientType>) -> Self {
        self.sinks.late = Some(sink.into());
        self
    }

    pub fn quarantine_sink(mut self, sink: impl Into<SinkClientType>) -> Self {
        self.sinks.quarantine = Some(sink.into());
        self
    }

    pub fn dead_letter_sink(mut self, sink: impl Into<SinkClientType>) -> Self {
        self.sinks.dead_letter = Some(sink.into());
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let PipelineBuilder {
            config,
            source,
            store,
            sinks,
        } = self;
        let sinks_config = &config.sinks;
        let configured = |given: Option<SinkClientType>, config: Option<&SinkConfig>, role| {
            given.or_else(|| config.map(|c| SinkClientType::new(c, role)))
        };

        let sinks = ResolvedSinks {
            results: sinks
                .results
                .unwrap_or_else(|| SinkClientType::new(&sinks_config.results, SinkRole::Results)),
            records: configured(sinks.records, sinks_config.records.as_ref(), SinkRole::Records),
            late: configured(sinks.late, sinks_config.late.as_ref(), SinkRole::Late),
            quarantine: configured(
                sinks.quarantine,
                sinks_config.quarantine.as_ref(),
                SinkRole::Quarantine,
            ),
            dead_letter: configured(
                sinks.dead_letter,
                sinks_config.dead_letter.as_ref(),
                SinkRole::DeadLetter,
            ),
        };
        let store = store.unwrap_or_else(|| CheckpointStoreType::new(&config.checkpoint.storage));

        Ok(Pipeline {
            config: Arc::new(config),
            source: Arc::new(source),
            store,
            sinks,
        })
    }
}

struct ResolvedSinks {
    results: SinkClientType,
    records: Option<SinkClientType>,
    late: Option<SinkClientType>,
    quarantine: Option<SinkClientType>,
    dead_letter: Option<SinkClientType>,
}

/// A built, not yet running pipeline.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    source: Arc<SourceType>,
    store: CheckpointStoreType,
    sinks: ResolvedSinks,
}

enum Command {
    Checkpoint {
        respond_to: oneshot::Sender<Result<u64>>,
    },
}

/// Controls a running pipeline.
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    progress: Arc<Progress>,
    supervisor: JoinHandle<Result<PipelineReport>>,
    tasks: Vec<AbortHandle>,
}

impl PipelineHandle {
    /// Runs a checkpoint cycle right away and returns its id.
    pub async fn checkpoint_now(&self) -> Result<u64> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Checkpoint { respond_to })
            .await
            .map_err(|_| Error::Cancelled)?;
        response.await?
    }

    /// Last folded offset per partition.
    pub fn offsets(&self) -> BTreeMap<PartitionId, Offset> {
        self.progress.offsets()
    }

    /// Starts a graceful shutdown: drain, finalize what the watermark allows, final checkpoint.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the pipeline to stop.
    pub async fn join(self) -> Result<PipelineReport> {
        self.supervisor
            .await
            .map_err(|e| Error::ActorPatternRecv(format!("pipeline supervisor failed: {e}")))?
    }

    /// Stops every task on the spot, without draining or checkpointing, as a crash would.
    pub async fn crash(self) {
        self.supervisor.abort();
        for task in &self.tasks {
            task.abort();
        }
        let _ = self.supervisor.await;
    }
}

impl Pipeline {
    /// Restores from the latest committed checkpoint and starts consuming. Runs until `cancel`
    /// fires or a fatal error occurs.
    pub async fn start(self, cancel: CancellationToken) -> Result<PipelineHandle> {
        self.launch(cancel, false).await
    }

    /// Consumes a bounded source to its end, then finalizes every window, checkpoints and stops.
    pub async fn drain_to_end(self) -> Result<PipelineReport> {
        self.launch(CancellationToken::new(), true)
            .await?
            .join()
            .await
    }

    async fn launch(self, cancel: CancellationToken, drain: bool) -> Result<PipelineHandle> {
        let Pipeline {
            config,
            source,
            store,
            sinks,
        } = self;

        // restore
        let checkpoint = store.load_latest().await?;
        let partitions = source.partitions();
        let tracker = Arc::new(WatermarkTracker::new(
            &partitions,
            config.allowed_lateness(),
            config.idle_timeout(),
        ));
        let (offsets, windows, watermark, last_committed) = match checkpoint {
            Some(Checkpoint {
                id,
                offsets,
                watermarks,
                windows,
                ..
            }) => {
                info!(
                    id,
                    ?offsets,
                    windows = windows.len(),
                    "Restoring from checkpoint"
                );
                tracker.restore(&watermarks);
                (offsets, windows, watermarks.global, Some(id))
            }
            None => {
                info!("No committed checkpoint, starting fresh");
                (BTreeMap::new(), Vec::new(), None, None)
            }
        };
        // replay starts strictly after the committed offsets
        for (partition, offset) in &offsets {
            source.seek(*partition, offset + 1).await?;
        }

        // sinks
        let mut tasks = Vec::new();
        let mut dispatcher_tasks = Vec::new();
        let dead_letter = sinks.dead_letter.map(|sink| Arc::new(Mutex::new(sink)));
        let mut start_dispatcher = |role: SinkRole, sink: SinkClientType| {
            let (handle, task) =
                SinkDispatcher::new(role, sink, dead_letter.as_ref().map(Arc::clone), &config.sinks)
                    .start();
            tasks.push(task.abort_handle());
            dispatcher_tasks.push(task);
            handle
        };
        let results = start_dispatcher(SinkRole::Results, sinks.results);
        let records = sinks
            .records
            .map(|sink| start_dispatcher(SinkRole::Records, sink));
        let late = sinks.late.map(|sink| start_dispatcher(SinkRole::Late, sink));
        let quarantine = sinks
            .quarantine
            .map(|sink| start_dispatcher(SinkRole::Quarantine, sink));
        let dispatchers: Vec<DispatcherHandle> = [
            Some(results.clone()),
            records.clone(),
            late.clone(),
            quarantine.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();

        // shards
        let (shards, shard_tasks) = Shards::start(&config, results, late, windows, watermark);
        tasks.extend(shard_tasks.iter().map(JoinHandle::abort_handle));

        // readers
        let progress = Arc::new(Progress::new(config.checkpoint.record_threshold, offsets));
        let ctx = ReaderContext {
            source: Arc::clone(&source),
            validator: Arc::new(Validator::new(&config)),
            tracker: Arc::clone(&tracker),
            shards: shards.clone(),
            progress: Arc::clone(&progress),
            records,
            quarantine,
            batch_size: config.read_batch_size,
            read_timeout: config.read_timeout(),
            stop_when_exhausted: drain,
        };
        let readers_cancel = CancellationToken::new();
        let mut readers = JoinSet::new();
        let mut partition_handles = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let (reader, handle) = PartitionReader::new(partition, ctx.clone());
            partition_handles.push(handle);
            let token = readers_cancel.clone();
            readers.spawn(async move { (partition, reader.run(token).await) });
        }
        drop(ctx);

        let coordinator = CheckpointCoordinator::new(
            config.checkpoint.clone(),
            store,
            shards.clone(),
            Arc::clone(&tracker),
            Arc::clone(&progress),
            partition_handles,
            dispatchers.clone(),
            last_committed,
        );

        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let supervisor = Supervisor {
            config: Arc::clone(&config),
            coordinator,
            shards,
            tracker,
            progress: Arc::clone(&progress),
            readers,
            readers_cancel,
            commands,
            dispatchers,
            shard_tasks,
            dispatcher_tasks,
            drain,
        };
        let supervisor = tokio::spawn(supervisor.run(cancel.clone()));

        Ok(PipelineHandle {
            commands: commands_tx,
            cancel,
            progress,
            supervisor,
            tasks,
        })
    }
}

enum Event {
    Cancelled,
    CheckpointDue,
    WatermarkTick,
    Command(Command),
    ReaderDone(std::result::Result<(PartitionId, Result<()>), JoinError>),
}

/// Owns the coordinator and decides when to checkpoint and when to stop.
struct Supervisor {
    config: Arc<PipelineConfig>,
    coordinator: CheckpointCoordinator,
    shards: Shards,
    tracker: Arc<WatermarkTracker>,
    progress: Arc<Progress>,
    readers: JoinSet<(PartitionId, Result<()>)>,
    readers_cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    dispatchers: Vec<DispatcherHandle>,
    shard_tasks: Vec<JoinHandle<()>>,
    dispatcher_tasks: Vec<JoinHandle<()>>,
    drain: bool,
}

impl Supervisor {
    async fn run(mut self, cancel: CancellationToken) -> Result<PipelineReport> {
        match self.supervise(&cancel).await {
            Ok(()) => self.stop().await,
            Err(e) => {
                error!(
                    ?e,
                    last_committed = ?self.coordinator.last_committed(),
                    "Fatal error, halting pipeline"
                );
                self.readers_cancel.cancel();
                self.readers.abort_all();
                for task in self.shard_tasks.iter().chain(&self.dispatcher_tasks) {
                    task.abort();
                }
                Err(e)
            }
        }
    }

    /// Runs until cancelled, until every reader is done, or until a fatal error.
    async fn supervise(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut checkpoint_ticker = tokio::time::interval(self.config.checkpoint.interval());
        checkpoint_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        checkpoint_ticker.tick().await;
        let mut watermark_ticker = tokio::time::interval(self.config.read_timeout());
        watermark_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.drain && self.readers.is_empty() {
            return Ok(());
        }
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Cancelled,
                _ = checkpoint_ticker.tick() => Event::CheckpointDue,
                _ = self.progress.threshold_reached() => Event::CheckpointDue,
                _ = watermark_ticker.tick() => Event::WatermarkTick,
                Some(command) = self.commands.recv() => Event::Command(command),
                Some(done) = self.readers.join_next() => Event::ReaderDone(done),
            };

            match event {
                Event::Cancelled => {
                    info!("Shutdown requested, draining");
                    return Ok(());
                }
                Event::CheckpointDue => {
                    self.coordinator.checkpoint().await?;
                    checkpoint_ticker.reset();
                }
                Event::WatermarkTick => {
                    // idle partitions may let the global watermark move without new records
                    if let Some(watermark) = self.tracker.advance_global() {
                        pipeline_metrics()
                            .watermark
                            .set(watermark.timestamp_millis());
                        self.shards.advance(watermark).await?;
                    }
                }
                Event::Command(Command::Checkpoint { respond_to }) => {
                    let result = self.coordinator.checkpoint().await;
                    let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
                    let _ = respond_to.send(result);
                    if let Some(e) = fatal {
                        return Err(e);
                    }
                }
                Event::ReaderDone(Ok((partition, Ok(())))) => {
                    info!(partition, "Partition reader finished");
                    if self.readers.is_empty() {
                        info!("All partitions consumed");
                        return Ok(());
                    }
                }
                Event::ReaderDone(Ok((partition, Err(e)))) => {
                    error!(partition, ?e, "Partition reader failed");
                    return Err(e);
                }
                Event::ReaderDone(Err(e)) => {
                    return Err(Error::Source(format!("partition reader panicked: {e}")));
                }
            }
        }
    }

    /// Stops the readers, finalizes what may be finalized, forces a final checkpoint and waits
    /// for the shards and sinks to wind down.
    async fn stop(mut self) -> Result<PipelineReport> {
        self.readers_cancel.cancel();
        while let Some(done) = self.readers.join_next().await {
            match done {
                Ok((_, Ok(()))) => {}
                Ok((partition, Err(e))) => {
                    warn!(partition, ?e, "Partition reader failed while stopping")
                }
                Err(e) => warn!(?e, "Partition reader panicked while stopping"),
            }
        }

        let watermark = if self.drain {
            // nothing more will ever arrive, every window can close
            Some(DateTime::<Utc>::MAX_UTC)
        } else {
            self.tracker.advance_global().or_else(|| self.tracker.global())
        };
        if let Some(watermark) = watermark {
            self.shards.advance(watermark).await?;
        }

        let last_checkpoint = self.coordinator.checkpoint().await?;
        let report = PipelineReport {
            last_checkpoint: Some(last_checkpoint),
            offsets: self.progress.offsets(),
            watermark: self.tracker.global(),
            windows: self.shards.report(),
            sinks: self.dispatchers.iter().map(DispatcherHandle::report).collect(),
        };

        // dropping the last senders lets shards and dispatchers run dry
        let Supervisor {
            coordinator,
            shards,
            dispatchers,
            shard_tasks,
            dispatcher_tasks,
            ..
        } = self;
        drop((coordinator, shards, dispatchers));
        for task in shard_tasks.into_iter().chain(dispatcher_tasks) {
            if let Err(e) = task.await {
                warn!(?e, "Task failed while stopping");
            }
        }
        info!(?report, "Pipeline stopped");
        Ok(report)
    }
}

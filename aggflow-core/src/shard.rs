//! Grouping keys are hashed onto a fixed number of shards. A shard is an actor owning the window
//! manager and aggregate store of its keys, so window state is only ever touched by one task and
//! partition readers never contend on it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::aggregate::{AggregateStore, WindowSnapshot};
use crate::config::{AggregationSpec, LateDataPolicy, PipelineConfig};
use crate::error::Error;
use crate::message::{Record, WindowKey, WindowState};
use crate::metrics::{pipeline_metrics, shard_labels};
use crate::shared::stable_hash;
use crate::sink::SinkItem;
use crate::sink::dispatcher::DispatcherHandle;
use crate::window::{Admission, LatenessGate, WindowManager, expired};

const SHARD_CHANNEL_SIZE: usize = 1000;

/// ShardMessage is a message that is sent to a shard actor.
pub(crate) enum ShardMessage {
    /// Fold a record. `watermark` is the global watermark when the record was routed.
    Record {
        record: Record,
        watermark: Option<DateTime<Utc>>,
    },
    /// Close and finalize every window expired at this watermark.
    Advance { watermark: DateTime<Utc> },
    Snapshot {
        checkpoint_id: u64,
        respond_to: oneshot::Sender<ShardSnapshot>,
    },
    /// The checkpoint committed, windows finalized before it can go.
    Evict { checkpoint_id: u64 },
}

/// Copy of the in-flight windows of a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSnapshot {
    pub shard: usize,
    pub windows: Vec<WindowSnapshot>,
}

#[derive(Debug, Default)]
struct ShardStats {
    folded: AtomicU64,
    late_dropped: AtomicU64,
    late_side_output: AtomicU64,
    late_admitted: AtomicU64,
    finalized: AtomicU64,
}

/// Per shard counters of what happened to records and windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReport {
    pub folded: u64,
    pub late_dropped: u64,
    pub late_side_output: u64,
    pub late_admitted: u64,
    pub finalized: u64,
}

impl ShardReport {
    pub(crate) fn add(&mut self, other: &ShardReport) {
        self.folded += other.folded;
        self.late_dropped += other.late_dropped;
        self.late_side_output += other.late_side_output;
        self.late_admitted += other.late_admitted;
        self.finalized += other.finalized;
    }
}

struct ShardActor {
    id: usize,
    receiver: mpsc::Receiver<ShardMessage>,
    manager: WindowManager,
    store: AggregateStore,
    gate: LatenessGate,
    watermark: Option<DateTime<Utc>>,
    results: DispatcherHandle,
    late: Option<DispatcherHandle>,
    /// Windows finalized before a checkpoint, evicted once it commits.
    pending_eviction: BTreeMap<u64, Vec<WindowKey>>,
    stats: Arc<ShardStats>,
}

impl ShardActor {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message).await;
        }
        debug!(shard = self.id, windows = self.store.len(), "Shard stopped");
    }

    async fn handle_message(&mut self, message: ShardMessage) {
        match message {
            ShardMessage::Record { record, watermark } => self.fold(record, watermark).await,
            ShardMessage::Advance { watermark } => self.advance(watermark).await,
            ShardMessage::Snapshot {
                checkpoint_id,
                respond_to,
            } => {
                let finalized = self.store.finalized();
                if !finalized.is_empty() {
                    self.pending_eviction.insert(checkpoint_id, finalized);
                }
                let _ = respond_to.send(ShardSnapshot {
                    shard: self.id,
                    windows: self.store.snapshot(),
                });
            }
            ShardMessage::Evict { checkpoint_id } => {
                let keep = self.pending_eviction.split_off(&(checkpoint_id + 1));
                let evictable = std::mem::replace(&mut self.pending_eviction, keep);
                let evicted: usize = evictable
                    .values()
                    .map(|windows| self.store.evict(windows))
                    .sum();
                debug!(shard = self.id, checkpoint_id, evicted, "Evicted finalized windows");
            }
        }
    }

    async fn fold(&mut self, record: Record, watermark: Option<DateTime<Utc>>) {
        let watermark = match (self.watermark, watermark) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let labels = shard_labels(self.id);
        let candidates = self.manager.assign(&record);

        match self.gate.admit(&self.manager, candidates, watermark) {
            Admission::Accept(windows) => {
                if let Some(watermark) = watermark
                    && windows
                        .iter()
                        .any(|w| expired(w, watermark, self.gate.allowed_lateness))
                {
                    self.stats.late_admitted.fetch_add(1, Ordering::Relaxed);
                    pipeline_metrics()
                        .late_admitted_total
                        .get_or_create(&labels)
                        .inc();
                }
                for operation in self.manager.place(&record, windows) {
                    self.store.apply(&operation, &record);
                }
                self.stats.folded.fetch_add(1, Ordering::Relaxed);
                pipeline_metrics().folded_total.get_or_create(&labels).inc();
                pipeline_metrics()
                    .windows_open
                    .get_or_create(&labels)
                    .set(self.manager.open_windows() as i64);
            }
            Admission::Late => self.late(record, watermark).await,
        }
    }

    async fn late(&mut self, record: Record, watermark: Option<DateTime<Utc>>) {
        let labels = shard_labels(self.id);
        let e = Error::LateData(format!(
            "record {} of key {} at {} is behind watermark {:?}",
            record.idempotency_key(),
            record.key,
            record.event_time,
            watermark
        ));
        match (self.gate.policy, &self.late) {
            (LateDataPolicy::SideOutput, Some(late)) => {
                debug!(shard = self.id, ?e, "Routing late record to side output");
                self.stats.late_side_output.fetch_add(1, Ordering::Relaxed);
                pipeline_metrics()
                    .late_side_output_total
                    .get_or_create(&labels)
                    .inc();
                if let Err(e) = late.emit(vec![SinkItem::late(record)]).await {
                    error!(shard = self.id, ?e, "Emitting late record");
                }
            }
            (policy, late) => {
                if policy == LateDataPolicy::SideOutput && late.is_none() {
                    warn!(shard = self.id, "No late sink configured, dropping late record");
                }
                debug!(shard = self.id, ?e, "Dropping late record");
                self.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
                pipeline_metrics()
                    .late_dropped_total
                    .get_or_create(&labels)
                    .inc();
            }
        }
    }

    async fn advance(&mut self, watermark: DateTime<Utc>) {
        if self.watermark.is_some_and(|current| current >= watermark) {
            return;
        }
        self.watermark = Some(watermark);

        let closed = self.manager.advance(watermark, self.gate.allowed_lateness);
        if closed.is_empty() {
            return;
        }
        for window in &closed {
            self.store.mark_closing(window);
        }
        // closed is in ascending start order, so is the emission
        let results: Vec<SinkItem> = closed
            .iter()
            .filter_map(|window| self.store.finalize(window))
            .map(SinkItem::aggregate)
            .collect();

        let labels = shard_labels(self.id);
        let count = results.len() as u64;
        self.stats.finalized.fetch_add(count, Ordering::Relaxed);
        pipeline_metrics()
            .windows_finalized_total
            .get_or_create(&labels)
            .inc_by(count);
        pipeline_metrics()
            .windows_open
            .get_or_create(&labels)
            .set(self.manager.open_windows() as i64);
        debug!(shard = self.id, %watermark, finalized = count, "Finalized windows");

        if let Err(e) = self.results.emit(results).await {
            error!(shard = self.id, ?e, "Emitting window results");
        }
    }
}

/// Handle to a running shard.
#[derive(Clone)]
pub(crate) struct ShardHandle {
    id: usize,
    sender: mpsc::Sender<ShardMessage>,
    stats: Arc<ShardStats>,
}

impl ShardHandle {
    async fn send(&self, message: ShardMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::ActorPatternRecv(format!("shard {} is gone", self.id)))
    }

    pub(crate) fn report(&self) -> ShardReport {
        ShardReport {
            folded: self.stats.folded.load(Ordering::Relaxed),
            late_dropped: self.stats.late_dropped.load(Ordering::Relaxed),
            late_side_output: self.stats.late_side_output.load(Ordering::Relaxed),
            late_admitted: self.stats.late_admitted.load(Ordering::Relaxed),
            finalized: self.stats.finalized.load(Ordering::Relaxed),
        }
    }
}

/// The shards of a pipeline and the key routing onto them. Cloned into every partition reader.
#[derive(Clone)]
pub(crate) struct Shards {
    handles: Vec<ShardHandle>,
}

/// Stable for a given key and shard count, also across restarts and builds.
pub(crate) fn shard_for(key: &str, shards: usize) -> usize {
    (stable_hash(key.as_bytes()) % shards.max(1) as u64) as usize
}

impl Shards {
    /// Spawns `config.shards` shard actors, restoring the windows of a checkpoint onto the shard
    /// owning their key.
    pub(crate) fn start(
        config: &PipelineConfig,
        results: DispatcherHandle,
        late: Option<DispatcherHandle>,
        restored: Vec<WindowSnapshot>,
        watermark: Option<DateTime<Utc>>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let count = config.shards.max(1);
        let aggregations: Arc<[AggregationSpec]> = config.aggregations.clone().into();
        let gate = LatenessGate::new(config);

        let mut per_shard: Vec<Vec<WindowSnapshot>> = vec![Vec::new(); count];
        for snapshot in restored {
            if let Some(windows) = per_shard.get_mut(shard_for(&snapshot.window.key, count)) {
                windows.push(snapshot);
            }
        }

        let mut handles = Vec::with_capacity(count);
        let mut tasks = Vec::with_capacity(count);
        for (id, windows) in per_shard.into_iter().enumerate() {
            let (sender, receiver) = mpsc::channel(SHARD_CHANNEL_SIZE);
            let stats = Arc::new(ShardStats::default());
            let mut actor = ShardActor {
                id,
                receiver,
                manager: WindowManager::new(&config.window),
                store: AggregateStore::new(Arc::clone(&aggregations)),
                gate,
                watermark,
                results: results.clone(),
                late: late.clone(),
                pending_eviction: BTreeMap::new(),
                stats: Arc::clone(&stats),
            };
            let restored = windows.len();
            for snapshot in windows {
                if snapshot.state != WindowState::Finalized {
                    actor.manager.restore(snapshot.window.clone());
                    actor.store.restore(snapshot);
                }
            }
            if restored > 0 {
                info!(shard = id, restored, "Restored windows");
            }
            tasks.push(tokio::spawn(actor.run()));
            handles.push(ShardHandle { id, sender, stats });
        }
        (Self { handles }, tasks)
    }

    pub(crate) async fn route(
        &self,
        record: Record,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let shard = shard_for(&record.key, self.handles.len());
        let handle = self
            .handles
            .get(shard)
            .ok_or_else(|| Error::ActorPatternRecv(format!("no shard {shard}")))?;
        handle
            .send(ShardMessage::Record { record, watermark })
            .await
    }

    pub(crate) async fn advance(&self, watermark: DateTime<Utc>) -> Result<()> {
        for handle in &self.handles {
            handle.send(ShardMessage::Advance { watermark }).await?;
        }
        Ok(())
    }

    /// Every shard answers after the messages queued before the request, so the snapshot holds
    /// exactly the records routed so far.
    pub(crate) async fn snapshot(&self, checkpoint_id: u64) -> Result<Vec<ShardSnapshot>> {
        let mut pending = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            let (respond_to, snapshot) = oneshot::channel();
            handle
                .send(ShardMessage::Snapshot {
                    checkpoint_id,
                    respond_to,
                })
                .await?;
            pending.push(snapshot);
        }
        Ok(try_join_all(pending).await?)
    }

    pub(crate) async fn evict(&self, checkpoint_id: u64) -> Result<()> {
        for handle in &self.handles {
            handle.send(ShardMessage::Evict { checkpoint_id }).await?;
        }
        Ok(())
    }

    pub(crate) fn report(&self) -> ShardReport {
        let mut report = ShardReport::default();
        for handle in &self.handles {
            report.add(&handle.report());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::config::{SinksConfig, WindowConfig};
    use crate::shared::test_utils::{record, utc};
    use crate::sink::dispatcher::SinkDispatcher;
    use crate::sink::{MemorySink, SinkPayload, SinkRole};
    use crate::value::Value;

    fn dispatcher(role: SinkRole, sink: &MemorySink) -> (DispatcherHandle, JoinHandle<()>) {
        let config = SinksConfig {
            batch_size: 1,
            batch_timeout_ms: 10,
            ..Default::default()
        };
        SinkDispatcher::new(role, sink.clone().into(), None, &config).start()
    }

    fn config(policy: LateDataPolicy) -> PipelineConfig {
        PipelineConfig {
            window: WindowConfig::Tumbling { size_ms: 300_000 },
            allowed_lateness_ms: 30_000,
            late_data_policy: policy,
            shards: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tumbling_scenario_finalizes_and_drops_late_record() {
        let ten = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        let results_sink = MemorySink::new();
        let (results, _) = dispatcher(SinkRole::Results, &results_sink);
        let (shards, _) = Shards::start(&config(LateDataPolicy::Drop), results.clone(), None, vec![], None);

        shards.route(record(0, 0, "A", ten), None).await.unwrap();
        shards.route(record(0, 1, "A", ten + 10_000), None).await.unwrap();
        // 10:05:31
        shards.advance(utc(ten + 331_000)).await.unwrap();
        shards.route(record(0, 2, "A", ten + 5_000), Some(utc(ten + 331_000))).await.unwrap();

        // the snapshot round trip guarantees every shard handled its queue
        shards.snapshot(1).await.unwrap();
        results.flush().await.unwrap();

        let items = results_sink.items();
        assert_eq!(items.len(), 1);
        let SinkPayload::Aggregate(agg) = &items[0].payload else {
            panic!("expected an aggregate");
        };
        assert_eq!(agg.window.start, utc(ten));
        assert_eq!(agg.window.end, utc(ten + 300_000));
        assert_eq!(agg.values.get("count"), Some(&Value::Int(2)));
        assert_eq!(agg.record_count, 2);

        let report = shards.report();
        assert_eq!(report.folded, 2);
        assert_eq!(report.late_dropped, 1);
        assert_eq!(report.finalized, 1);
    }

    #[tokio::test]
    async fn finalizes_in_ascending_start_order() {
        let results_sink = MemorySink::new();
        let (results, _) = dispatcher(SinkRole::Results, &results_sink);
        let config = PipelineConfig {
            window: WindowConfig::Tumbling { size_ms: 10_000 },
            allowed_lateness_ms: 0,
            shards: 1,
            ..Default::default()
        };
        let (shards, _) = Shards::start(&config, results.clone(), None, vec![], None);
        for (offset, ms) in [(0, 25_000), (1, 5_000), (2, 15_000)] {
            shards.route(record(0, offset, "A", ms), None).await.unwrap();
        }
        shards.advance(utc(30_000)).await.unwrap();
        shards.snapshot(1).await.unwrap();
        results.flush().await.unwrap();

        assert_eq!(
            results_sink.deliveries(),
            vec!["A:0-10000:0", "A:10000-20000:0", "A:20000-30000:0"]
        );
    }

    #[tokio::test]
    async fn late_records_go_to_side_output() {
        let results_sink = MemorySink::new();
        let late_sink = MemorySink::new();
        let (results, _) = dispatcher(SinkRole::Results, &results_sink);
        let (late, _) = dispatcher(SinkRole::Late, &late_sink);
        let (shards, _) = Shards::start(
            &config(LateDataPolicy::SideOutput),
            results,
            Some(late.clone()),
            vec![],
            None,
        );
        shards.route(record(0, 0, "A", 0), None).await.unwrap();
        shards.advance(utc(400_000)).await.unwrap();
        shards.route(record(0, 1, "A", 1_000), Some(utc(400_000))).await.unwrap();
        shards.snapshot(1).await.unwrap();
        late.flush().await.unwrap();

        assert_eq!(late_sink.deliveries(), vec!["0-1"]);
        assert_eq!(shards.report().late_side_output, 1);
    }

    #[tokio::test]
    async fn admit_folds_into_open_window_behind_the_watermark() {
        let results_sink = MemorySink::new();
        let (results, _) = dispatcher(SinkRole::Results, &results_sink);
        let (shards, _) =
            Shards::start(&config(LateDataPolicy::Admit), results.clone(), None, vec![], None);
        shards.route(record(0, 0, "A", 0), None).await.unwrap();
        // the global watermark already expired [0, 5m) but the shard has not advanced yet
        shards.route(record(0, 1, "A", 1_000), Some(utc(400_000))).await.unwrap();
        shards.advance(utc(400_000)).await.unwrap();
        // finalized now, admit no longer takes it
        shards.route(record(0, 2, "A", 2_000), Some(utc(400_000))).await.unwrap();
        shards.snapshot(1).await.unwrap();
        results.flush().await.unwrap();

        let report = shards.report();
        assert_eq!(report.late_admitted, 1);
        assert_eq!(report.late_dropped, 1);
        let items = results_sink.items();
        let SinkPayload::Aggregate(agg) = &items[0].payload else {
            panic!("expected an aggregate");
        };
        assert_eq!(agg.record_count, 2);
    }

    #[tokio::test]
    async fn finalized_windows_are_evicted_after_commit() {
        let results_sink = MemorySink::new();
        let (results, _) = dispatcher(SinkRole::Results, &results_sink);
        let config = PipelineConfig {
            window: WindowConfig::Tumbling { size_ms: 10_000 },
            allowed_lateness_ms: 0,
            shards: 1,
            ..Default::default()
        };
        let (shards, _) = Shards::start(&config, results, None, vec![], None);
        shards.route(record(0, 0, "A", 1_000), None).await.unwrap();
        shards.route(record(0, 1, "A", 11_000), None).await.unwrap();
        shards.advance(utc(10_000)).await.unwrap();

        // the finalized window is no longer part of a snapshot
        let snapshot = shards.snapshot(1).await.unwrap();
        assert_eq!(snapshot[0].windows.len(), 1);
        assert_eq!(snapshot[0].windows[0].window.start, utc(10_000));
        shards.evict(1).await.unwrap();
        let snapshot = shards.snapshot(2).await.unwrap();
        assert_eq!(snapshot[0].windows.len(), 1);
    }

    #[test]
    fn routing_is_stable() {
        assert_eq!(shard_for("A", 4), shard_for("A", 4));
        assert!(shard_for("anything", 4) < 4);
        assert_eq!(shard_for("anything", 1), 0);
        assert_eq!(shard_for("", 7), (0x2D06_8005_38D3_94C2_u64 % 7) as usize);
    }
}

//! One reader task per source partition: poll, skip offsets that were already folded, validate,
//! observe the event time, route the record to the shard owning its key, and broadcast the
//! global watermark whenever it moves. Records of a partition are handled strictly in offset
//! order. Between records the reader answers pause requests of the checkpoint coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;
use crate::Result;
use crate::backoff::strategy::Exponential;
use crate::message::{Offset, PartitionId, RawRecord};
use crate::metrics::{partition_labels, pipeline_metrics, validation_labels};
use crate::shard::Shards;
use crate::sink::SinkItem;
use crate::sink::dispatcher::DispatcherHandle;
use crate::source::{Source, SourceType};
use crate::validator::Validator;
use crate::watermark::WatermarkTracker;

const UNAVAILABLE_INITIAL_RETRY_INTERVAL_IN_MS: u64 = 100;
const UNAVAILABLE_MAX_RETRY_INTERVAL_IN_MS: u64 = 10_000;

/// Last folded offset per partition, shared by the readers and the checkpoint coordinator.
#[derive(Debug)]
pub(crate) struct Progress {
    offsets: Mutex<BTreeMap<PartitionId, Offset>>,
    since_checkpoint: AtomicU64,
    threshold: Option<u64>,
    threshold_reached: Notify,
}

impl Progress {
    pub(crate) fn new(threshold: Option<u64>, restored: BTreeMap<PartitionId, Offset>) -> Self {
        Self {
            offsets: Mutex::new(restored),
            since_checkpoint: AtomicU64::new(0),
            threshold,
            threshold_reached: Notify::new(),
        }
    }

    pub(crate) fn last_offset(&self, partition: PartitionId) -> Option<Offset> {
        self.offsets.lock().get(&partition).copied()
    }

    /// The record at `offset` is folded, or rejected, and must never be applied again.
    pub(crate) fn folded(&self, partition: PartitionId, offset: Offset) {
        self.offsets.lock().insert(partition, offset);
        let count = self.since_checkpoint.fetch_add(1, Ordering::Relaxed) + 1;
        if self.threshold.is_some_and(|threshold| count == threshold) {
            self.threshold_reached.notify_one();
        }
    }

    pub(crate) fn offsets(&self) -> BTreeMap<PartitionId, Offset> {
        self.offsets.lock().clone()
    }

    pub(crate) fn reset_since_checkpoint(&self) {
        self.since_checkpoint.store(0, Ordering::Relaxed);
    }

    /// Resolves once `record_threshold` records were handled since the last checkpoint.
    pub(crate) async fn threshold_reached(&self) {
        match self.threshold {
            Some(_) => self.threshold_reached.notified().await,
            None => std::future::pending().await,
        }
    }
}

pub(crate) enum PartitionControl {
    /// Stop between two records, acknowledge on `paused` and wait for `resume`.
    Pause {
        paused: oneshot::Sender<()>,
        resume: oneshot::Receiver<()>,
    },
}

/// Controls a running reader.
#[derive(Clone)]
pub(crate) struct PartitionHandle {
    partition: PartitionId,
    sender: mpsc::Sender<PartitionControl>,
}

impl PartitionHandle {
    /// Pauses the reader. Returns the sender resuming it, `None` when the reader is gone.
    pub(crate) async fn pause(&self) -> Option<oneshot::Sender<()>> {
        let (paused, is_paused) = oneshot::channel();
        let (resume_tx, resume) = oneshot::channel();
        self.sender
            .send(PartitionControl::Pause { paused, resume })
            .await
            .ok()?;
        match is_paused.await {
            Ok(()) => Some(resume_tx),
            Err(_) => {
                debug!(partition = self.partition, "Reader finished before pausing");
                None
            }
        }
    }
}

/// Everything a reader shares with the rest of the pipeline.
#[derive(Clone)]
pub(crate) struct ReaderContext {
    pub(crate) source: Arc<SourceType>,
    pub(crate) validator: Arc<Validator>,
    pub(crate) tracker: Arc<WatermarkTracker>,
    pub(crate) shards: Shards,
    pub(crate) progress: Arc<Progress>,
    pub(crate) records: Option<DispatcherHandle>,
    pub(crate) quarantine: Option<DispatcherHandle>,
    pub(crate) batch_size: usize,
    pub(crate) read_timeout: Duration,
    /// Return once a bounded source is exhausted instead of waiting for more records.
    pub(crate) stop_when_exhausted: bool,
}

pub(crate) struct PartitionReader {
    partition: PartitionId,
    ctx: ReaderContext,
    control: mpsc::Receiver<PartitionControl>,
}

impl PartitionReader {
    pub(crate) fn new(partition: PartitionId, ctx: ReaderContext) -> (Self, PartitionHandle) {
        let (sender, control) = mpsc::channel(1);
        (
            Self {
                partition,
                ctx,
                control,
            },
            PartitionHandle { partition, sender },
        )
    }

    /// Reads until cancelled, or until the source is exhausted when asked to stop there. Only
    /// fatal errors end the reader early.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let partition = self.partition;
        let labels = partition_labels(partition);
        let mut backoff = Exponential::from_millis(
            UNAVAILABLE_INITIAL_RETRY_INTERVAL_IN_MS,
            UNAVAILABLE_MAX_RETRY_INTERVAL_IN_MS,
            2.0,
            0.1,
            None,
        );
        info!(partition, "Starting partition reader");

        loop {
            while let Ok(control) = self.control.try_recv() {
                self.handle_control(control).await;
            }
            if cancel.is_cancelled() {
                break;
            }
            if self.ctx.stop_when_exhausted && self.ctx.source.is_exhausted(partition) {
                info!(partition, "Partition exhausted");
                break;
            }

            match self.ctx.source.poll(partition, self.ctx.batch_size).await {
                Ok(batch) if batch.is_empty() => {
                    backoff.reset();
                    self.wait(self.ctx.read_timeout, &cancel).await;
                }
                Ok(batch) => {
                    backoff.reset();
                    self.process(batch).await?;
                }
                Err(Error::SourceUnavailable(reason)) => {
                    pipeline_metrics()
                        .source_unavailable_total
                        .get_or_create(&labels)
                        .inc();
                    let delay = backoff
                        .next()
                        .unwrap_or(Duration::from_millis(UNAVAILABLE_MAX_RETRY_INTERVAL_IN_MS));
                    warn!(
                        partition,
                        retry_attempt = backoff.attempt(),
                        ?delay,
                        %reason,
                        "Source unavailable, backing off"
                    );
                    self.wait(delay, &cancel).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(partition, last_offset = ?self.ctx.progress.last_offset(partition), "Partition reader stopped");
        Ok(())
    }

    /// Sleeps, but stays responsive to pause requests and cancellation.
    async fn wait(&mut self, duration: Duration, cancel: &CancellationToken) {
        let control = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            _ = cancel.cancelled() => None,
            Some(control) = self.control.recv() => Some(control),
        };
        if let Some(control) = control {
            self.handle_control(control).await;
        }
    }

    async fn handle_control(&mut self, control: PartitionControl) {
        match control {
            PartitionControl::Pause { paused, resume } => {
                if paused.send(()).is_ok() {
                    // a dropped sender resumes as well
                    let _ = resume.await;
                }
            }
        }
    }

    async fn process(&mut self, batch: Vec<RawRecord>) -> Result<()> {
        let partition = self.partition;
        let labels = partition_labels(partition);
        for raw in batch {
            if self
                .ctx
                .progress
                .last_offset(partition)
                .is_some_and(|last| raw.offset <= last)
            {
                pipeline_metrics()
                    .duplicates_skipped_total
                    .get_or_create(&labels)
                    .inc();
                continue;
            }
            pipeline_metrics().read_total.get_or_create(&labels).inc();

            match self.ctx.validator.validate(&raw) {
                Ok(record) => {
                    self.ctx.tracker.observe(partition, record.event_time);
                    if let Some(records) = &self.ctx.records {
                        records.emit(vec![SinkItem::record(record.clone())]).await?;
                    }
                    let watermark = self.ctx.tracker.global();
                    self.ctx.shards.route(record, watermark).await?;
                    if let Some(watermark) = self.ctx.tracker.advance_global() {
                        pipeline_metrics()
                            .watermark
                            .set(watermark.timestamp_millis());
                        self.ctx.shards.advance(watermark).await?;
                    }
                }
                Err(e) => {
                    pipeline_metrics()
                        .validation_failures_total
                        .get_or_create(&validation_labels(partition, e.reason.kind()))
                        .inc();
                    debug!(partition, error = %e, "Rejected record");
                    if let Some(quarantine) = &self.ctx.quarantine {
                        quarantine.emit(vec![SinkItem::quarantined((&e).into())]).await?;
                    }
                }
            }
            self.ctx.progress.folded(partition, raw.offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn threshold_notifies_once_reached() {
        let progress = Arc::new(Progress::new(Some(2), BTreeMap::from([(0, 9)])));
        assert_eq!(progress.last_offset(0), Some(9));

        progress.folded(0, 10);
        progress.folded(1, 0);
        // the permit is stored by notify_one, so this does not wait
        tokio::time::timeout(Duration::from_secs(1), progress.threshold_reached())
            .await
            .unwrap();
        assert_eq!(progress.offsets(), BTreeMap::from([(0, 10), (1, 0)]));

        progress.reset_since_checkpoint();
        progress.folded(0, 11);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), progress.threshold_reached())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn pause_of_a_finished_reader_is_a_no_op() {
        let (sender, receiver) = mpsc::channel(1);
        let handle = PartitionHandle {
            partition: 0,
            sender,
        };
        drop(receiver);
        assert!(handle.pause().await.is_none());
    }
}

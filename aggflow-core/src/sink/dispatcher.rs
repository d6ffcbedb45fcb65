//! Every sink role gets its own dispatcher task. Items are sent over a bounded channel, batched
//! with `chunks_timeout`, written, and only the failed items of a batch are retried with an
//! exponential backoff. Whatever is still failing once the retries run out goes to the
//! dead-letter sink and is reported as a [`Error::SinkDelivery`], the pipeline keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::pin;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::backoff::strategy::Exponential;
use crate::config::{RetryConfig, SinksConfig};
use crate::error::Error;
use crate::metrics::{pipeline_metrics, sink_labels};
use crate::sink::{Sink, SinkClientType, SinkItem, SinkRole, SinkStatus};
use crate::Result;

const DISPATCHER_CHANNEL_SIZE: usize = 1000;

/// The dead-letter sink is shared by all dispatchers.
pub type DeadLetterSink = Arc<Mutex<SinkClientType>>;

/// DispatcherMessage is a message that is sent to the dispatcher task.
pub(crate) enum DispatcherMessage {
    Item(SinkItem),
    /// Answered once every item sent before it has been delivered or dead-lettered.
    Flush { respond_to: oneshot::Sender<()> },
}

#[derive(Debug, Default)]
struct DispatcherStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    delivery_errors: AtomicU64,
}

/// Delivery counters of one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherReport {
    pub role: Option<SinkRole>,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub delivery_errors: u64,
}

/// Cheap, cloneable handle to a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    role: SinkRole,
    sender: mpsc::Sender<DispatcherMessage>,
    stats: Arc<DispatcherStats>,
}

impl DispatcherHandle {
    /// Hands a batch of items to the dispatcher. Waits only while the channel is full.
    pub async fn emit(&self, items: Vec<SinkItem>) -> Result<()> {
        for item in items {
            self.sender
                .send(DispatcherMessage::Item(item))
                .await
                .map_err(|_| Error::Sink(format!("{} dispatcher is gone", self.role)))?;
        }
        Ok(())
    }

    /// Waits until everything emitted so far has left the dispatcher.
    pub async fn flush(&self) -> Result<()> {
        let (respond_to, done) = oneshot::channel();
        self.sender
            .send(DispatcherMessage::Flush { respond_to })
            .await
            .map_err(|_| Error::Sink(format!("{} dispatcher is gone", self.role)))?;
        done.await?;
        Ok(())
    }

    pub fn role(&self) -> SinkRole {
        self.role
    }

    pub fn report(&self) -> DispatcherReport {
        DispatcherReport {
            role: Some(self.role),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            delivery_errors: self.stats.delivery_errors.load(Ordering::Relaxed),
        }
    }
}

/// Delivers the items of one sink role.
pub struct SinkDispatcher {
    role: SinkRole,
    sink: SinkClientType,
    dead_letter: Option<DeadLetterSink>,
    batch_size: usize,
    batch_timeout: Duration,
    retry: RetryConfig,
    stats: Arc<DispatcherStats>,
}

impl SinkDispatcher {
    pub fn new(
        role: SinkRole,
        sink: SinkClientType,
        dead_letter: Option<DeadLetterSink>,
        config: &SinksConfig,
    ) -> Self {
        Self {
            role,
            sink,
            dead_letter,
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            retry: config.retry.clone(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    /// Spawns the dispatcher. It runs until every [`DispatcherHandle`] is dropped and the last
    /// batch is delivered.
    pub fn start(self) -> (DispatcherHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(DISPATCHER_CHANNEL_SIZE);
        let handle = DispatcherHandle {
            role: self.role,
            sender,
            stats: Arc::clone(&self.stats),
        };
        let task = tokio::spawn(self.run(ReceiverStream::new(receiver)));
        (handle, task)
    }

    async fn run(mut self, messages: ReceiverStream<DispatcherMessage>) {
        info!(role = %self.role, batch_size = self.batch_size, batch_timeout = ?self.batch_timeout, "Starting sink dispatcher");
        let chunk_stream = messages.chunks_timeout(self.batch_size, self.batch_timeout);
        pin!(chunk_stream);

        while let Some(batch) = chunk_stream.next().await {
            let mut items = Vec::with_capacity(batch.len());
            let mut flushes = Vec::new();
            for message in batch {
                match message {
                    DispatcherMessage::Item(item) => items.push(item),
                    DispatcherMessage::Flush { respond_to } => flushes.push(respond_to),
                }
            }

            if !items.is_empty()
                && let Err(e) = self.deliver(items).await
            {
                // non fatal, the items are with the dead-letter sink or logged
                error!(role = %self.role, ?e, "Delivering batch");
            }

            for respond_to in flushes {
                let _ = respond_to.send(());
            }
        }
        info!(role = %self.role, report = ?self.stats, "Sink dispatcher stopped");
    }

    /// Writes the batch and retries only the failed items until success or the retry limit.
    async fn deliver(&mut self, items: Vec<SinkItem>) -> Result<()> {
        let labels = sink_labels(self.role.as_str());
        let start = Instant::now();
        let mut backoff = Exponential::from(&self.retry);
        let mut retry_attempt = 0u16;
        let mut to_retry = items;
        let mut error_map = HashMap::new();

        loop {
            let responses = match self.sink.write(to_retry.clone()).await {
                Ok(responses) => responses,
                Err(e) => to_retry
                    .iter()
                    .map(|item| crate::sink::SinkResponse::failed(&item.id, e.to_string()))
                    .collect(),
            };
            let mut result_map = responses
                .into_iter()
                .map(|resp| (resp.id, resp.status))
                .collect::<HashMap<_, _>>();

            let mut delivered = 0u64;
            to_retry.retain(|item| match result_map.remove(&item.id) {
                Some(SinkStatus::Success) => {
                    delivered += 1;
                    false
                }
                Some(SinkStatus::Failed(reason)) => {
                    *error_map.entry(reason).or_insert(0) += 1;
                    true
                }
                None => {
                    *error_map
                        .entry("no response from sink".to_string())
                        .or_insert(0) += 1;
                    true
                }
            });
            self.stats.delivered.fetch_add(delivered, Ordering::Relaxed);
            pipeline_metrics()
                .sink_write_total
                .get_or_create(&labels)
                .inc_by(delivered);

            if to_retry.is_empty() {
                break;
            }

            match backoff.next() {
                Some(delay) => {
                    retry_attempt += 1;
                    warn!(
                        role = %self.role,
                        ?retry_attempt,
                        ?error_map,
                        "Retrying failed sink items."
                    );
                    error_map.clear();
                    self.stats
                        .retried
                        .fetch_add(to_retry.len() as u64, Ordering::Relaxed);
                    pipeline_metrics()
                        .sink_retries_total
                        .get_or_create(&labels)
                        .inc_by(to_retry.len() as u64);
                    tokio::time::sleep(delay).await;
                }
                None => break,
            }
        }

        pipeline_metrics()
            .sink_write_time
            .get_or_create(&labels)
            .observe(start.elapsed().as_micros() as f64);

        if to_retry.is_empty() {
            return Ok(());
        }

        warn!(
            role = %self.role,
            retry_attempts = ?retry_attempt,
            errors = ?error_map,
            remaining = to_retry.len(),
            "Retries exhausted, forwarding to dead letter."
        );
        self.stats.delivery_errors.fetch_add(1, Ordering::Relaxed);
        pipeline_metrics()
            .sink_delivery_errors_total
            .get_or_create(&labels)
            .inc();
        let failed = to_retry.len();
        self.dead_letter(to_retry).await;
        Err(Error::SinkDelivery(format!(
            "{failed} {} items undeliverable after {} attempts: {error_map:?}",
            self.role,
            retry_attempt + 1
        )))
    }

    /// One attempt at the dead-letter sink. Items it rejects are only logged.
    async fn dead_letter(&self, items: Vec<SinkItem>) {
        let count = items.len() as u64;
        self.stats.dead_lettered.fetch_add(count, Ordering::Relaxed);
        pipeline_metrics()
            .sink_dead_lettered_total
            .get_or_create(&sink_labels(self.role.as_str()))
            .inc_by(count);

        let Some(dead_letter) = &self.dead_letter else {
            for item in &items {
                error!(role = %self.role, id = %item.id, "No dead letter sink, dropping item");
            }
            return;
        };
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        match dead_letter.lock().await.write(items).await {
            Ok(responses) => {
                for response in responses {
                    if let SinkStatus::Failed(reason) = response.status {
                        error!(role = %self.role, id = %response.id, %reason, "Dead letter sink rejected item");
                    }
                }
            }
            Err(e) => error!(role = %self.role, ?ids, ?e, "Writing to dead letter sink"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::record;
    use crate::sink::MemorySink;

    // batches fill up exactly with the items plus the flush, so each test sees a fixed number of writes
    fn sinks_config(max_attempts: u16, batch_size: usize) -> SinksConfig {
        SinksConfig {
            batch_size,
            batch_timeout_ms: 1_000,
            retry: RetryConfig {
                max_attempts,
                initial_interval_ms: 1,
                max_interval_ms: 5,
                factor: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn items(n: u64) -> Vec<SinkItem> {
        (0..n)
            .map(|offset| SinkItem::record(record(0, offset, "A", 1_000)))
            .collect()
    }

    #[tokio::test]
    async fn delivers_and_flushes() {
        let sink = MemorySink::new();
        let dispatcher =
            SinkDispatcher::new(SinkRole::Records, sink.clone().into(), None, &sinks_config(3, 13));
        let (handle, task) = dispatcher.start();

        handle.emit(items(25)).await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(sink.len(), 25);
        assert_eq!(handle.report().delivered, 25);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retries_only_failed_items() {
        let sink = MemorySink::new();
        sink.fail_item("0-3", 2);
        let dispatcher =
            SinkDispatcher::new(SinkRole::Results, sink.clone().into(), None, &sinks_config(3, 6));
        let (handle, task) = dispatcher.start();

        handle.emit(items(5)).await.unwrap();
        handle.flush().await.unwrap();

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 5, "nothing delivered twice: {deliveries:?}");
        assert_eq!(deliveries.last().map(String::as_str), Some("0-3"));
        assert_eq!(sink.writes(), 3);
        let report = handle.report();
        assert_eq!(report.retried, 2);
        assert_eq!(report.dead_lettered, 0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_dead_letter() {
        let sink = MemorySink::new();
        sink.fail_item("0-1", usize::MAX);
        let dead_letter = MemorySink::new();
        let dispatcher = SinkDispatcher::new(
            SinkRole::Results,
            sink.clone().into(),
            Some(Arc::new(Mutex::new(dead_letter.clone().into()))),
            &sinks_config(3, 4),
        );
        let (handle, task) = dispatcher.start();

        handle.emit(items(3)).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(sink.len(), 2);
        let dead = dead_letter.items();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, "0-1");
        let report = handle.report();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.delivery_errors, 1);
        // first try plus two retries
        assert_eq!(sink.writes(), 3);

        drop(handle);
        task.await.unwrap();
    }
}

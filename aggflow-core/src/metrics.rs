use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tracing::{debug, error, info};

use crate::Error;
use crate::message::PartitionId;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "aggflow";

// Define the labels for the metrics
const PARTITION_LABEL: &str = "partition";
const SHARD_LABEL: &str = "shard";
const SINK_ROLE_LABEL: &str = "sink";
const REASON_LABEL: &str = "reason";

// counters, prometheus-client adds the `_total` suffix
const READ: &str = "read";
const DUPLICATES_SKIPPED: &str = "duplicates_skipped";
const VALIDATION_FAILURES: &str = "validation_failures";
const SOURCE_UNAVAILABLE: &str = "source_unavailable";
const FOLDED: &str = "folded";
const LATE_DROPPED: &str = "late_dropped";
const LATE_SIDE_OUTPUT: &str = "late_side_output";
const LATE_ADMITTED: &str = "late_admitted";
const WINDOWS_FINALIZED: &str = "windows_finalized";
const SINK_WRITE: &str = "sink_write";
const SINK_RETRIES: &str = "sink_retries";
const SINK_DEAD_LETTERED: &str = "sink_dead_lettered";
const SINK_DELIVERY_ERRORS: &str = "sink_delivery_errors";
const CHECKPOINTS: &str = "checkpoints";
const CHECKPOINT_FAILURES: &str = "checkpoint_failures";

// gauges
const WINDOWS_OPEN: &str = "windows_open";
const WATERMARK: &str = "watermark";
const LAST_CHECKPOINT: &str = "last_checkpoint";

// histograms
const SINK_WRITE_TIME: &str = "sink_write_time";
const CHECKPOINT_SNAPSHOT_TIME: &str = "checkpoint_snapshot_time";
const CHECKPOINT_PERSIST_TIME: &str = "checkpoint_persist_time";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered exactly once, contention only happens on scrapes
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

type Labels = Vec<(String, String)>;

/// Metrics of the aggregation pipeline. Every metric is a family keyed by its labels.
pub(crate) struct PipelineMetrics {
    // source side, per partition
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) duplicates_skipped_total: Family<Labels, Counter>,
    pub(crate) validation_failures_total: Family<Labels, Counter>,
    pub(crate) source_unavailable_total: Family<Labels, Counter>,

    // windows, per shard
    pub(crate) folded_total: Family<Labels, Counter>,
    pub(crate) late_dropped_total: Family<Labels, Counter>,
    pub(crate) late_side_output_total: Family<Labels, Counter>,
    pub(crate) late_admitted_total: Family<Labels, Counter>,
    pub(crate) windows_finalized_total: Family<Labels, Counter>,
    pub(crate) windows_open: Family<Labels, Gauge>,

    // global watermark in epoch millis
    pub(crate) watermark: Gauge,

    // sinks, per role
    pub(crate) sink_write_total: Family<Labels, Counter>,
    pub(crate) sink_retries_total: Family<Labels, Counter>,
    pub(crate) sink_dead_lettered_total: Family<Labels, Counter>,
    pub(crate) sink_delivery_errors_total: Family<Labels, Counter>,
    pub(crate) sink_write_time: Family<Labels, Histogram>,

    // checkpoints
    pub(crate) checkpoints_total: Counter,
    pub(crate) checkpoint_failures_total: Counter,
    pub(crate) last_checkpoint: Gauge,
    pub(crate) checkpoint_snapshot_time: Histogram,
    pub(crate) checkpoint_persist_time: Histogram,
}

/// Exponential bucket distribution with range, `length` buckets from `min` to `max` (micros).
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let length = length.max(2);
    let min = min.max(f64::MIN_POSITIVE);
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::successors(Some(min), move |b| Some(b * growth_factor)).take(length.into())
}

fn latency_histogram() -> Histogram {
    Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10))
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            duplicates_skipped_total: Family::default(),
            validation_failures_total: Family::default(),
            source_unavailable_total: Family::default(),
            folded_total: Family::default(),
            late_dropped_total: Family::default(),
            late_side_output_total: Family::default(),
            late_admitted_total: Family::default(),
            windows_finalized_total: Family::default(),
            windows_open: Family::default(),
            watermark: Gauge::default(),
            sink_write_total: Family::default(),
            sink_retries_total: Family::default(),
            sink_dead_lettered_total: Family::default(),
            sink_delivery_errors_total: Family::default(),
            sink_write_time: Family::<Labels, Histogram>::new_with_constructor(latency_histogram),
            checkpoints_total: Counter::default(),
            checkpoint_failures_total: Counter::default(),
            last_checkpoint: Gauge::default(),
            checkpoint_snapshot_time: latency_histogram(),
            checkpoint_persist_time: latency_histogram(),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);
        registry.register(READ, "Records read from the source", metrics.read_total.clone());
        registry.register(
            DUPLICATES_SKIPPED,
            "Records skipped because their offset was already folded",
            metrics.duplicates_skipped_total.clone(),
        );
        registry.register(
            VALIDATION_FAILURES,
            "Records rejected by the validator",
            metrics.validation_failures_total.clone(),
        );
        registry.register(
            SOURCE_UNAVAILABLE,
            "Polls that failed because the source was unavailable",
            metrics.source_unavailable_total.clone(),
        );
        registry.register(
            FOLDED,
            "Records folded into window accumulators",
            metrics.folded_total.clone(),
        );
        registry.register(
            LATE_DROPPED,
            "Late records dropped by the late data policy",
            metrics.late_dropped_total.clone(),
        );
        registry.register(
            LATE_SIDE_OUTPUT,
            "Late records routed to the late side output",
            metrics.late_side_output_total.clone(),
        );
        registry.register(
            LATE_ADMITTED,
            "Late records admitted into windows that were still open",
            metrics.late_admitted_total.clone(),
        );
        registry.register(
            WINDOWS_FINALIZED,
            "Windows finalized and handed to the results sink",
            metrics.windows_finalized_total.clone(),
        );
        registry.register(
            WINDOWS_OPEN,
            "Windows currently open",
            metrics.windows_open.clone(),
        );
        registry.register(
            WATERMARK,
            "Global watermark in epoch milliseconds",
            metrics.watermark.clone(),
        );
        registry.register(
            SINK_WRITE,
            "Items delivered to a sink",
            metrics.sink_write_total.clone(),
        );
        registry.register(
            SINK_RETRIES,
            "Delivery retries of failed sink items",
            metrics.sink_retries_total.clone(),
        );
        registry.register(
            SINK_DEAD_LETTERED,
            "Items routed to the dead letter sink after exhausting retries",
            metrics.sink_dead_lettered_total.clone(),
        );
        registry.register(
            SINK_DELIVERY_ERRORS,
            "Batches that could not be delivered",
            metrics.sink_delivery_errors_total.clone(),
        );
        registry.register(
            SINK_WRITE_TIME,
            "Time taken to deliver a batch to a sink in microseconds",
            metrics.sink_write_time.clone(),
        );
        registry.register(
            CHECKPOINTS,
            "Checkpoints committed",
            metrics.checkpoints_total.clone(),
        );
        registry.register(
            CHECKPOINT_FAILURES,
            "Checkpoint persist attempts that failed",
            metrics.checkpoint_failures_total.clone(),
        );
        registry.register(
            LAST_CHECKPOINT,
            "Id of the last committed checkpoint",
            metrics.last_checkpoint.clone(),
        );
        registry.register(
            CHECKPOINT_SNAPSHOT_TIME,
            "Time partitions were paused for a snapshot in microseconds",
            metrics.checkpoint_snapshot_time.clone(),
        );
        registry.register(
            CHECKPOINT_PERSIST_TIME,
            "Time taken to persist and commit a checkpoint in microseconds",
            metrics.checkpoint_persist_time.clone(),
        );
        metrics
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub(crate) fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

pub(crate) fn partition_labels(partition: PartitionId) -> Labels {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

pub(crate) fn shard_labels(shard: usize) -> Labels {
    vec![(SHARD_LABEL.to_string(), shard.to_string())]
}

pub(crate) fn sink_labels(role: &str) -> Labels {
    vec![(SINK_ROLE_LABEL.to_string(), role.to_string())]
}

pub(crate) fn validation_labels(partition: PartitionId, reason: &str) -> Labels {
    vec![
        (PARTITION_LABEL.to_string(), partition.to_string()),
        (REASON_LABEL.to_string(), reason.to_string()),
    ]
}

/// Snapshot of the current state of the metrics in the global registry.
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    {
        let state = global_registry().registry.lock();
        if let Err(e) = encode(&mut buffer, &state) {
            error!(?e, "Encoding metrics");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    debug!("Exposing metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serves `/metrics` and `/livez` over plain HTTP until the process exits.
pub async fn start_metrics_server(addr: SocketAddr) -> crate::Result<()> {
    // registering eagerly exposes every metric from the first scrape on
    pipeline_metrics();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Metrics server listening");
    axum::serve(listener, metrics_router())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}

/// router for metrics and health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[tokio::test]
    async fn exposes_registered_metrics() {
        pipeline_metrics()
            .late_dropped_total
            .get_or_create(&shard_labels(0))
            .inc();
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("aggflow_late_dropped_total{shard=\"0\"}"));
        assert!(text.contains("aggflow_checkpoints_total"));
    }

    #[test]
    fn bucket_range() {
        let buckets: Vec<f64> = exponential_buckets_range(1.0, 1000.0, 4).collect();
        assert_eq!(buckets.len(), 4);
        assert!((buckets[3] - 1000.0).abs() < 1e-6);
        assert!((buckets[1] - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn livez_is_no_content() {
        assert_eq!(livez().await.into_response().status(), StatusCode::NO_CONTENT);
    }
}

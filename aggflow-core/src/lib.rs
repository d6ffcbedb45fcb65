//! Windowed, fault-tolerant stream aggregation engine.
//!
//! Records are polled from a partitioned [source], validated by the [validator], observed by the
//! [watermark] tracker and routed by grouping key to single-writer [shard]s. Every shard owns a
//! [window] manager and an [aggregate] store; windows are finalized once the watermark passes
//! their end plus the allowed lateness and the results are handed to the [sink] dispatchers. The
//! [checkpoint] coordinator periodically snapshots offsets, watermarks and in-flight windows so a
//! restarted [pipeline] restores and replays only the unconsumed offsets.

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::error::{Error, Result};

/// Custom Error handling.
mod error;

/// Retry with backoff, used by the sink dispatchers, the source readers and checkpoint persistence.
pub mod backoff;

/// Immutable pipeline configuration built once at startup.
pub mod config;

/// Tagged value tree used for record payloads.
pub mod value;

/// Records, window keys and aggregate results.
pub mod message;

/// Structural and schema validation of raw records.
pub mod validator;

/// Per-partition and global event-time watermarks.
pub mod watermark;

/// Tumbling, sliding and session window assignment.
pub mod window;

/// Accumulators and the per-shard window store.
pub mod aggregate;

/// Single-writer ownership of grouping keys.
pub(crate) mod shard;

/// Sink interface, builtin sinks and the dispatcher.
pub mod sink;

/// Source interface and builtin sources.
pub mod source;

/// Checkpoint format, storage backends and the coordinator.
pub mod checkpoint;

/// Wires everything together and runs it.
pub mod pipeline;

/// Prometheus metrics and the metrics server.
pub mod metrics;

/// Shared helpers.
pub(crate) mod shared;

use crate::config::PipelineConfig;
use crate::pipeline::PipelineBuilder;

/// Runs the pipeline described by the configuration until the cancellation token fires or a fatal
/// error occurs.
pub async fn run(config: PipelineConfig, cln_token: CancellationToken) -> Result<()> {
    config.validate()?;

    if let Some(port) = config.metrics_port {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr).await {
                tracing::error!(?e, "Metrics server exited");
            }
        });
    }

    let pipeline = PipelineBuilder::from_config(config)?.build()?;
    let handle = pipeline.start(cln_token).await?;
    let report = handle.join().await?;
    info!(last_checkpoint = ?report.last_checkpoint, "Exiting pipeline");
    Ok(())
}

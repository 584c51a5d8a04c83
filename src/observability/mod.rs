//! Logging and metrics.
//!
//! Every component logs through `tracing`. Counters and gauges go through the
//! `metrics` facade and are exported by [`run_metrics_server`] when enabled.

use crate::config::ObservabilityConfig;
use crate::error::{DfsError, Result};
use ::tracing::info;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| DfsError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| DfsError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| DfsError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move { handle.render() }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| DfsError::Internal(format!("Metrics server failed: {}", e)))?;

    Ok(())
}

fn register_metrics() {
    // Controller
    gauge!("dfs_nodes_online").set(0.0);
    counter!("dfs_heartbeats_received_total").absolute(0);
    counter!("dfs_nodes_evicted_total").absolute(0);
    counter!("dfs_replication_orders_total").absolute(0);
    counter!("dfs_unrecoverable_chunks_total").absolute(0);

    // Storage node
    counter!("dfs_heartbeats_sent_total").absolute(0);
    counter!("dfs_chunks_stored_total").absolute(0);
    counter!("dfs_chunks_served_total").absolute(0);
    counter!("dfs_bytes_stored_total").absolute(0);
    counter!("dfs_bytes_served_total").absolute(0);
    counter!("dfs_checksum_mismatches_total").absolute(0);
}

pub fn record_chunk_stored(bytes: u64) {
    counter!("dfs_chunks_stored_total").increment(1);
    counter!("dfs_bytes_stored_total").increment(bytes);
}

pub fn record_chunk_served(bytes: u64) {
    counter!("dfs_chunks_served_total").increment(1);
    counter!("dfs_bytes_served_total").increment(bytes);
}

pub fn record_checksum_mismatch() {
    counter!("dfs_checksum_mismatches_total").increment(1);
}

pub fn record_heartbeat_sent() {
    counter!("dfs_heartbeats_sent_total").increment(1);
}

pub fn record_heartbeat_received() {
    counter!("dfs_heartbeats_received_total").increment(1);
}

/// Record a node declared offline.
pub fn record_node_evicted() {
    counter!("dfs_nodes_evicted_total").increment(1);
}

pub fn record_replication_order() {
    counter!("dfs_replication_orders_total").increment(1);
}

/// Record a chunk that could not be re-replicated, labelled by cause.
pub fn record_unrecoverable_chunk(reason: &str) {
    counter!("dfs_unrecoverable_chunks_total", "reason" => reason.to_string()).increment(1);
}

pub fn set_online_nodes(count: usize) {
    gauge!("dfs_nodes_online").set(count as f64);
}

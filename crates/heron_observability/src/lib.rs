//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,heron=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on the given address.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Count response bytes flushed to clients.
pub fn record_response_bytes(bytes: u64) {
    metrics::counter!("heron_frontend_bytes_sent_total").increment(bytes);
}

/// Record one processed query.
pub fn record_query_metrics(duration_us: u64, table: &str, success: bool) {
    metrics::counter!("heron_queries_total", "table" => table.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("heron_query_duration_us", "table" => table.to_string())
        .record(duration_us as f64);
}

use crate::RenderError;
use metrics::{gauge, histogram, increment_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub const RENDERS_TOTAL: &str = "render_pool_renders_total";
pub const RENDER_FAILURES_TOTAL: &str = "render_pool_render_failures_total";
pub const RENDER_DURATION_SECONDS: &str = "render_pool_render_duration_seconds";
pub const JOBS_SKIPPED_TOTAL: &str = "render_pool_jobs_skipped_total";
pub const RATE_LIMITED_TOTAL: &str = "render_pool_rate_limited_total";
pub const POOL_RESTARTS_TOTAL: &str = "render_pool_pool_restarts_total";
pub const QUEUE_DEPTH: &str = "render_pool_queue_depth";

pub fn record_render(duration: Duration, result: &Result<Vec<u8>, RenderError>) {
    match result {
        Ok(_) => increment_counter!(RENDERS_TOTAL),
        Err(e) => increment_counter!(RENDER_FAILURES_TOTAL, "kind" => e.kind()),
    }
    histogram!(RENDER_DURATION_SECONDS, duration.as_secs_f64());
}

pub fn record_skipped_job() {
    increment_counter!(JOBS_SKIPPED_TOTAL);
}

pub fn record_rate_limited() {
    increment_counter!(RATE_LIMITED_TOTAL);
}

pub fn record_pool_restart() {
    increment_counter!(POOL_RESTARTS_TOTAL);
}

pub fn set_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH, depth as f64);
}

/// Install the Prometheus recorder and its scrape listener.
///
/// Without an installed recorder the helpers above are no-ops.
pub fn install_prometheus(bind_address: &str, port: u16) -> Result<(), RenderError> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .map_err(|e| RenderError::Configuration(format!("invalid metrics address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RenderError::Configuration(format!("metrics exporter: {e}")))?;

    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

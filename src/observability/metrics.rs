//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): forwarded requests by method, status
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_upstream_errors_total` (counter): forwarding failures by kind
//! - `proxy_active_connections` (gauge): open client connections
//! - `proxy_pool_idle_connections` (gauge): idle backend connections
//! - `proxy_pool_dials_total` / `proxy_pool_reused_total` (counters)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is opt-in

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::upstream::ErrorKind;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(kind: ErrorKind) {
    counter!("proxy_upstream_errors_total", "kind" => kind.as_str()).increment(1);
}

pub fn set_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn set_pool_idle(count: usize) {
    gauge!("proxy_pool_idle_connections").set(count as f64);
}

pub fn record_backend_dial() {
    counter!("proxy_pool_dials_total").increment(1);
}

pub fn record_pool_reuse() {
    counter!("proxy_pool_reused_total").increment(1);
}

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `orchestrator_requests_total` (counter): calls by backend, outcome
//! - `orchestrator_request_duration_seconds` (histogram): call latency
//! - `orchestrator_backend_health` (gauge): 1=healthy, 0.5=degraded, 0=unhealthy
//! - `orchestrator_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `orchestrator_rate_limited_total` (counter): calls refused locally
//! - `orchestrator_tool_executions_total` (counter): tool calls by server, tool, outcome
//! - `orchestrator_resource_cache_size` (gauge): cached resources
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::health::HealthStatus;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// One completed call against a backend.
pub fn record_request(backend: &str, success: bool, latency: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "orchestrator_requests_total",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("orchestrator_request_duration_seconds", "backend" => backend.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_backend_health(backend: &str, status: HealthStatus) {
    gauge!("orchestrator_backend_health", "backend" => backend.to_string()).set(status.as_gauge());
}

pub fn record_circuit_state(backend: &str, state: CircuitState) {
    gauge!("orchestrator_circuit_state", "backend" => backend.to_string()).set(state.as_gauge());
}

pub fn record_rate_limited(backend: &str) {
    counter!("orchestrator_rate_limited_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_tool_execution(server: &str, tool: &str, outcome: &'static str) {
    counter!(
        "orchestrator_tool_executions_total",
        "server" => server.to_string(),
        "tool" => tool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_cache_size(size: usize) {
    gauge!("orchestrator_resource_cache_size").set(size as f64);
}

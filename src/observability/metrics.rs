//! Metrics collection and exposition.
//!
//! # Metrics
//! - `auth_proxy_request_bytes_total` (counter): inbound bytes per finished session
//! - `auth_proxy_response_bytes_total` (counter): outbound bytes per finished session
//! - `auth_proxy_decisions_total` (counter): decisions by outcome and status
//! - `auth_proxy_header_wait_seconds` (histogram): first byte to decision
//! - `auth_proxy_backend_failures_total` (counter): failed backend connects
//! - `auth_proxy_protocol_violations_total` (counter): forbidden actions by kind
//! - `auth_proxy_active_connections` (gauge): open client connections
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps unit tests exporter-free
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;
use std::time::Duration;

use hyper::StatusCode;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_session_bytes(request_bytes: u64, response_bytes: u64) {
    counter!("auth_proxy_request_bytes_total").increment(request_bytes);
    counter!("auth_proxy_response_bytes_total").increment(response_bytes);
}

pub fn record_decision(outcome: &'static str, status: StatusCode) {
    counter!(
        "auth_proxy_decisions_total",
        "outcome" => outcome,
        "status" => status.as_str().to_owned()
    )
    .increment(1);
}

pub fn record_header_wait(waited: Duration) {
    histogram!("auth_proxy_header_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_backend_failure() {
    counter!("auth_proxy_backend_failures_total").increment(1);
}

pub fn record_protocol_violation(action: &'static str) {
    counter!("auth_proxy_protocol_violations_total", "action" => action).increment(1);
}

pub fn connection_opened() {
    gauge!("auth_proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("auth_proxy_active_connections").decrement(1.0);
}

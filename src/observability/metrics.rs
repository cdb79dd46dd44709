//! Metrics collection.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding process installs a recorder.
//!
//! # Metrics
//! - `gateway_connections_total` (counter): accepted connections by scheme
//! - `gateway_active_connections` (gauge): current connection count
//! - `gateway_requests_total` (counter): completed requests by method, status
//! - `gateway_request_duration_seconds` (histogram): handler latency
//! - `gateway_handling_failures_total` (counter): handler failures by scheme
//! - `gateway_protocol_errors_total` (counter): framing errors by kind

use std::time::Instant;

pub fn record_connection_accepted(scheme: &str) {
    metrics::counter!("gateway_connections_total", "scheme" => scheme.to_string()).increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("gateway_active_connections").set(count as f64);
}

/// Record one completed request and its latency.
pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_handling_failure(scheme: &str) {
    metrics::counter!("gateway_handling_failures_total", "scheme" => scheme.to_string())
        .increment(1);
}

pub fn record_protocol_error(kind: &'static str) {
    metrics::counter!("gateway_protocol_errors_total", "kind" => kind).increment(1);
}

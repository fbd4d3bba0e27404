//! Metrics collection and Prometheus exporter for chainwall.
//!
//! Connection counts, bytes moved through listeners, TLS handshake outcomes,
//! write backpressure events and error rates.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize Prometheus metrics exporter.
///
/// Starts an HTTP server on the given address to expose metrics.
/// Returns an error message if binding fails.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Total number of TCP connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chainwall_connections_total";
/// Number of currently active connections.
pub const CONNECTIONS_ACTIVE: &str = "chainwall_connections_active";
/// Total number of connections refused by a listener's address filter.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chainwall_connections_rejected_total";
/// Connection duration histogram (seconds).
pub const CONNECTION_DURATION_SECONDS: &str = "chainwall_connection_duration_seconds";
/// Total bytes read from peers.
pub const BYTES_RECEIVED_TOTAL: &str = "chainwall_bytes_received_total";
/// Total bytes written to peers.
pub const BYTES_SENT_TOTAL: &str = "chainwall_bytes_sent_total";
/// Total number of TLS handshakes by result.
pub const TLS_HANDSHAKES_TOTAL: &str = "chainwall_tls_handshakes_total";
/// TLS handshake duration histogram (seconds).
pub const TLS_HANDSHAKE_DURATION_SECONDS: &str = "chainwall_tls_handshake_duration_seconds";
/// Total number of times a listener paused writes after a short write.
pub const WRITE_PAUSES_TOTAL: &str = "chainwall_write_pauses_total";
/// Total number of contexts queued behind a paused write.
pub const WRITE_QUEUED_TOTAL: &str = "chainwall_write_queued_total";
/// Total number of errors by type.
pub const ERRORS_TOTAL: &str = "chainwall_errors_total";
/// Number of live lines per worker.
pub const WORKER_LINES_ACTIVE: &str = "chainwall_worker_lines_active";

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a new connection accepted.
#[inline]
pub fn record_connection_accepted() {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a connection closed.
#[inline]
pub fn record_connection_closed(duration_secs: f64) {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(duration_secs);
}

/// Record a connection refused by an allow/deny list.
#[inline]
pub fn record_connection_rejected() {
    counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
}

/// Record bytes read from a peer.
#[inline]
pub fn record_bytes_received(bytes: u64) {
    counter!(BYTES_RECEIVED_TOTAL).increment(bytes);
}

/// Record bytes written to a peer.
#[inline]
pub fn record_bytes_sent(bytes: u64) {
    counter!(BYTES_SENT_TOTAL).increment(bytes);
}

/// Record a completed TLS handshake.
#[inline]
pub fn record_tls_handshake(duration_secs: f64) {
    counter!(TLS_HANDSHAKES_TOTAL, "result" => "ok").increment(1);
    histogram!(TLS_HANDSHAKE_DURATION_SECONDS).record(duration_secs);
}

/// Record a TLS handshake that failed before completion.
#[inline]
pub fn record_tls_handshake_failed() {
    counter!(TLS_HANDSHAKES_TOTAL, "result" => "failed").increment(1);
}

/// Record a write pause.
#[inline]
pub fn record_write_paused() {
    counter!(WRITE_PAUSES_TOTAL).increment(1);
}

/// Record a context queued behind a paused write.
#[inline]
pub fn record_write_queued() {
    counter!(WRITE_QUEUED_TOTAL).increment(1);
}

/// Record an error by type.
#[inline]
pub fn record_error(error_type: &'static str) {
    counter!(ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Set the live line count of a worker.
#[inline]
pub fn set_worker_lines(worker: usize, lines: u64) {
    gauge!(WORKER_LINES_ACTIVE, "worker" => worker.to_string()).set(lines as f64);
}

// ============================================================================
// Error Type Constants (re-exported from chainwall-core)
// ============================================================================

pub use chainwall_core::{
    ERROR_CHAIN, ERROR_CONFIG, ERROR_IO, ERROR_TLS_HANDSHAKE, ERROR_TLS_RECORD,
};

//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "circle_relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "circle_relay_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "circle_relay_auth_failures_total";
    pub const EVENTS_TOTAL: &str = "circle_relay_events_total";
    pub const EVENTS_BYTES: &str = "circle_relay_events_bytes";
    pub const ROOMS_ACTIVE: &str = "circle_relay_rooms_active";
    pub const FANOUT_RECIPIENTS: &str = "circle_relay_fanout_recipients";
    pub const ERRORS_TOTAL: &str = "circle_relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of authenticated connections"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Handshakes rejected for missing, invalid or expired credentials"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total encoded bytes of events");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Recipients per comment or typing broadcast"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a rejected handshake.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record an event.
pub fn record_event(event: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
}

/// Record encoded bytes crossing the socket.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how many members a broadcast reached.
pub fn record_fanout(event: &'static str, recipients: usize) {
    histogram!(names::FANOUT_RECIPIENTS, "event" => event).record(recipients as f64);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

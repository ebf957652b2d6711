//! Metrics collection and export for Threadline.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use threadline_core::DeliveryDecision;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "threadline_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "threadline_connections_active";
    pub const SESSIONS_DISPLACED: &str = "threadline_sessions_displaced_total";
    pub const IDS_MINTED: &str = "threadline_ids_minted_total";
    pub const DELIVERIES_TOTAL: &str = "threadline_deliveries_total";
    pub const HISTORY_PAGES: &str = "threadline_history_pages_total";
    pub const HISTORY_RECORDS: &str = "threadline_history_records";
    pub const FRAME_SECONDS: &str = "threadline_frame_seconds";
    pub const ERRORS_TOTAL: &str = "threadline_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::SESSIONS_DISPLACED,
        "Sessions replaced by a newer connection of the same user"
    );
    metrics::describe_counter!(names::IDS_MINTED, "Message ids minted");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Per-recipient delivery decisions by outcome"
    );
    metrics::describe_counter!(names::HISTORY_PAGES, "History pages served");
    metrics::describe_histogram!(names::HISTORY_RECORDS, "Records per history page");
    metrics::describe_histogram!(
        names::FRAME_SECONDS,
        "Client frame handling time in seconds"
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

/// Record a session displaced by a reconnect.
pub fn record_displaced() {
    counter!(names::SESSIONS_DISPLACED).increment(1);
}

/// Record a minted message id.
pub fn record_id_minted() {
    counter!(names::IDS_MINTED).increment(1);
}

/// Record one delivery decision.
pub fn record_delivery(decision: DeliveryDecision) {
    counter!(names::DELIVERIES_TOTAL, "outcome" => decision.as_str()).increment(1);
}

/// Record a served history page.
pub fn record_history_page(records: usize) {
    counter!(names::HISTORY_PAGES).increment(1);
    histogram!(names::HISTORY_RECORDS).record(records as f64);
}

/// Record frame handling time.
pub fn record_frame_latency(seconds: f64) {
    histogram!(names::FRAME_SECONDS).record(seconds);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed: recording is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_delivery(DeliveryDecision::DeliverDirect);
        record_history_page(25);
    }
}

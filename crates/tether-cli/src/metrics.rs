//! Metrics collection and export for the Tether CLI.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tether_core::ConnectionState;
use tracing::info;

/// Metric names.
pub mod names {
    pub const STATE_CHANGES_TOTAL: &str = "tether_state_changes_total";
    pub const CONNECTED: &str = "tether_connected";
    pub const MESSAGES_TOTAL: &str = "tether_messages_total";
    pub const MESSAGES_BYTES: &str = "tether_messages_bytes";
    pub const CHANNELS_ATTACHED: &str = "tether_channels_attached";
    pub const PUBLISH_LATENCY_SECONDS: &str = "tether_publish_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::STATE_CHANGES_TOTAL,
        "Connection state changes, by new state"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the connection is connected");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Channel messages, by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Channel message payload bytes");
    metrics::describe_gauge!(names::CHANNELS_ATTACHED, "Channels currently attached");
    metrics::describe_histogram!(
        names::PUBLISH_LATENCY_SECONDS,
        "Time from publish to acknowledgement in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors, by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Metrics server listening");
    Ok(())
}

/// Record a connection state change.
pub fn record_state(state: ConnectionState) {
    counter!(names::STATE_CHANGES_TOTAL, "state" => state.as_str()).increment(1);
    let connected = if state == ConnectionState::Connected { 1.0 } else { 0.0 };
    gauge!(names::CONNECTED).set(connected);
}

/// Record a channel message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the time a publish took to be acknowledged.
pub fn record_publish_latency(seconds: f64) {
    histogram!(names::PUBLISH_LATENCY_SECONDS).record(seconds);
}

pub fn set_attached_channels(count: usize) {
    gauge!(names::CHANNELS_ATTACHED).set(count as f64);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op.
        record_state(ConnectionState::Connected);
        record_message(12, "in");
        record_publish_latency(0.01);
        set_attached_channels(2);
        record_error("publish");
    }
}

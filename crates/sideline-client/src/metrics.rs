//! Metrics for the device side of the alert channel.
//!
//! Uses the `metrics` crate for instrumentation; the Prometheus exporter is
//! only installed when enabled in configuration.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECT_ATTEMPTS_TOTAL: &str = "sideline_connect_attempts_total";
    pub const RECONNECTS_TOTAL: &str = "sideline_reconnects_total";
    pub const CHANNEL_OPEN: &str = "sideline_channel_open";
    pub const MESSAGES_TOTAL: &str = "sideline_messages_total";
    pub const SENDS_REJECTED_TOTAL: &str = "sideline_sends_rejected_total";
    pub const PROTOCOL_ERRORS_TOTAL: &str = "sideline_protocol_errors_total";
    pub const SESSION_CHANGES_TOTAL: &str = "sideline_session_changes_total";
}

/// Describe all metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECT_ATTEMPTS_TOTAL,
        "Connection attempts to the alert service"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Scheduled reconnects that fired");
    metrics::describe_gauge!(names::CHANNEL_OPEN, "1 while the alert channel is open");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Events sent and received");
    metrics::describe_counter!(
        names::SENDS_REJECTED_TOTAL,
        "Outbound events dropped because the channel was not open"
    );
    metrics::describe_counter!(
        names::PROTOCOL_ERRORS_TOTAL,
        "Inbound frames dropped as undecodable"
    );
    metrics::describe_counter!(
        names::SESSION_CHANGES_TOTAL,
        "Session changes produced by the tracker"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub(crate) fn record_connect_attempt() {
    counter!(names::CONNECT_ATTEMPTS_TOTAL).increment(1);
}

pub(crate) fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

pub(crate) fn set_channel_open(open: bool) {
    gauge!(names::CHANNEL_OPEN).set(if open { 1.0 } else { 0.0 });
}

pub(crate) fn record_message(kind: &'static str, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "type" => kind, "direction" => direction).increment(1);
}

pub(crate) fn record_send_rejected(kind: &'static str) {
    counter!(names::SENDS_REJECTED_TOTAL, "type" => kind).increment(1);
}

pub(crate) fn record_protocol_error() {
    counter!(names::PROTOCOL_ERRORS_TOTAL).increment(1);
}

pub(crate) fn record_session_change(kind: &'static str) {
    counter!(names::SESSION_CHANGES_TOTAL, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: calls are no-ops
        init_metrics();
        record_connect_attempt();
        record_message("ping", "out");
        set_channel_open(true);
    }
}

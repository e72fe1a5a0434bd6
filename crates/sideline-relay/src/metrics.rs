//! Relay metrics, exported in Prometheus format when enabled.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use sideline_protocol::Role;
use std::net::SocketAddr;
use tracing::info;

pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "sideline_relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "sideline_relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "sideline_relay_messages_total";
    pub const EMERGENCIES_ACTIVE: &str = "sideline_relay_emergencies_active";
    pub const EMERGENCIES_TOTAL: &str = "sideline_relay_emergencies_total";
    pub const ERRORS_TOTAL: &str = "sideline_relay_errors_total";
}

/// Register metric descriptions.
pub fn init_metrics() {
    metrics::describe_counter!(names::CONNECTIONS_TOTAL, "Device sockets accepted, by role");
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Device sockets open, by role");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Events relayed, by type and direction");
    metrics::describe_gauge!(names::EMERGENCIES_ACTIVE, "Emergencies not yet resolved");
    metrics::describe_counter!(names::EMERGENCIES_TOTAL, "Emergencies by lifecycle stage");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Relay errors, by kind");

    info!("Metrics initialized");
}

/// Install the Prometheus exporter on `0.0.0.0:port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_message(kind: &'static str, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "type" => kind, "direction" => direction).increment(1);
}

/// Count an emergency stage (`triggered`, `resolved`) and publish the
/// number still active.
pub fn record_emergency(stage: &'static str, active: usize) {
    counter!(names::EMERGENCIES_TOTAL, "stage" => stage).increment(1);
    gauge!(names::EMERGENCIES_ACTIVE).set(active as f64);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}

/// Counts one open device socket for as long as it lives.
pub struct ConnectionMetricsGuard {
    role: Role,
}

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new(role: Role) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "role" => role.as_str()).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "role" => role.as_str()).increment(1.0);
        Self { role }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "role" => self.role.as_str()).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        let guard = ConnectionMetricsGuard::new(Role::Referee);
        record_emergency("triggered", 1);
        record_message("pong", "outbound");
        drop(guard);
    }
}

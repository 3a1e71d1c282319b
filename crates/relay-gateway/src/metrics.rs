//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::error::{GatewayError, Result};

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup before any metrics are recorded. The returned
/// handle renders the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections registered (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections terminated (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram, seconds).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Refused connection attempts (counter, labels: reason).
pub const WS_ADMISSION_REJECTIONS_TOTAL: &str = "ws_admission_rejections_total";
/// Frames written to transports (counter).
pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
/// Messages placed in an outbound queue (counter).
pub const WS_MESSAGES_QUEUED_TOTAL: &str = "ws_messages_queued_total";
/// Messages evicted from a full outbound queue (counter).
pub const WS_QUEUE_EVICTIONS_TOTAL: &str = "ws_queue_evictions_total";
/// Connections closed by the heartbeat monitor (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// Connections closed by the health sweep (counter, labels: reason).
pub const WS_SWEEP_TERMINATIONS_TOTAL: &str = "ws_sweep_terminations_total";
/// Malformed inbound frames (counter).
pub const WS_INBOUND_ERRORS_TOTAL: &str = "ws_inbound_errors_total";

//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the gateway started.
    pub uptime_secs: u64,
    /// Registered WebSocket connections.
    pub connections: usize,
    /// Configured connection limit.
    pub max_connections: usize,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
    /// Configured compression preference.
    pub compression_enabled: bool,
    /// Whether permessage-deflate is actually negotiated. Always `false`.
    pub compression_negotiated: bool,
    /// Whether the heartbeat monitor runs.
    pub heartbeat_enabled: bool,
}

/// Inputs for [`health_check`].
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    /// When the gateway started.
    pub start_time: Instant,
    /// Registered connections.
    pub connections: usize,
    /// Configured limit.
    pub max_connections: usize,
    /// Shutdown flag.
    pub shutting_down: bool,
    /// Compression preference.
    pub compression_enabled: bool,
    /// Heartbeat flag.
    pub heartbeat_enabled: bool,
}

/// Build a health response from live counters.
pub fn health_check(inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: if inputs.shutting_down {
            "shutting_down".into()
        } else {
            "ok".into()
        },
        uptime_secs: inputs.start_time.elapsed().as_secs(),
        connections: inputs.connections,
        max_connections: inputs.max_connections,
        shutting_down: inputs.shutting_down,
        compression_enabled: inputs.compression_enabled,
        compression_negotiated: false,
        heartbeat_enabled: inputs.heartbeat_enabled,
    }
}

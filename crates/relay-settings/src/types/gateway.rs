//! Connection gateway settings.
//!
//! Durations are stored as milliseconds so the JSON file stays flat; the
//! gateway converts them into `Duration`s when it builds its runtime config.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Accepted ranges for gateway settings.
///
/// Shared by the env layer, [`GatewaySettings::validate`] and the gateway's
/// runtime config, so every source of a value gets the same bounds.
pub mod limits {
    use std::fmt::Display;
    use std::ops::RangeInclusive;

    /// Live connection cap.
    pub const MAX_CONNECTIONS: RangeInclusive<usize> = 1..=1_000_000;
    /// Heartbeat probe cadence.
    pub const PING_INTERVAL_MS: RangeInclusive<u64> = 100..=3_600_000;
    /// Pong deadline.
    pub const PONG_TIMEOUT_MS: RangeInclusive<u64> = 100..=600_000;
    /// Per-connection queue bound.
    pub const MESSAGE_QUEUE_SIZE: RangeInclusive<usize> = 1..=1_000_000;
    /// Health sweep cadence.
    pub const HEALTH_SWEEP_INTERVAL_MS: RangeInclusive<u64> = 100..=86_400_000;
    /// Sweep staleness multiplier. Zero would put the sweep threshold inside
    /// the heartbeat window.
    pub const STALE_MULTIPLIER: RangeInclusive<u32> = 1..=100;
    /// Shutdown grace period.
    pub const SHUTDOWN_GRACE_MS: RangeInclusive<u64> = 0..=600_000;
    /// Writer channel capacity.
    pub const SEND_BUFFER_SIZE: RangeInclusive<usize> = 1..=65_536;
    /// Largest inbound frame.
    pub const MAX_MESSAGE_SIZE: RangeInclusive<usize> = 1..=64 * 1024 * 1024;

    /// Check `value` against `range`, naming the setting on failure.
    pub fn check<T>(name: &str, value: T, range: &RangeInclusive<T>) -> Result<(), String>
    where
        T: PartialOrd + Display,
    {
        if range.contains(&value) {
            Ok(())
        } else {
            Err(format!(
                "{name} must be between {} and {}, got {value}",
                range.start(),
                range.end()
            ))
        }
    }
}

/// Connection gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Upgrade path for WebSocket connections.
    pub path: String,
    /// Hard cap on live connections.
    pub max_connections: usize,
    /// Heartbeat probe cadence in milliseconds.
    pub ping_interval_ms: u64,
    /// Per-probe liveness deadline in milliseconds.
    pub pong_timeout_ms: u64,
    /// Per-connection outbound queue bound.
    pub message_queue_size: usize,
    /// Whether payload compression should be negotiated.
    pub compression_enabled: bool,
    /// Whether the per-connection heartbeat monitor runs.
    pub heartbeat_enabled: bool,
    /// Whether the periodic health sweep runs.
    pub health_sweep_enabled: bool,
    /// Health sweep cadence in milliseconds.
    pub health_sweep_interval_ms: u64,
    /// The sweep declares a peer stale after
    /// `pingIntervalMs + staleMultiplier * pongTimeoutMs` without a pong.
    pub stale_multiplier: u32,
    /// Error count above which the sweep terminates a connection.
    pub max_error_count: u64,
    /// Enforce the origin allow-list.
    pub hardened: bool,
    /// Origins accepted in hardened mode. Empty disables the check.
    pub allowed_origins: Vec<String>,
    /// Grace period for connections to close during shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Frames buffered between a connection and its socket writer.
    pub send_buffer_size: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_connections: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 5_000,
            message_queue_size: 100,
            compression_enabled: true,
            heartbeat_enabled: true,
            health_sweep_enabled: true,
            health_sweep_interval_ms: 60_000,
            stale_multiplier: 2,
            max_error_count: 10,
            hardened: false,
            allowed_origins: Vec::new(),
            shutdown_grace_ms: 5_000,
            send_buffer_size: 256,
            max_message_size: 1024 * 1024,
        }
    }
}

impl GatewaySettings {
    /// Reject out-of-range values.
    ///
    /// Heartbeat timings are only checked while the heartbeat runs, the
    /// sweep interval only while the sweep runs.
    pub fn validate(&self) -> Result<()> {
        use limits::check;

        let mut checks = vec![
            check("maxConnections", self.max_connections, &limits::MAX_CONNECTIONS),
            check(
                "messageQueueSize",
                self.message_queue_size,
                &limits::MESSAGE_QUEUE_SIZE,
            ),
            check(
                "staleMultiplier",
                self.stale_multiplier,
                &limits::STALE_MULTIPLIER,
            ),
            check(
                "shutdownGraceMs",
                self.shutdown_grace_ms,
                &limits::SHUTDOWN_GRACE_MS,
            ),
            check("sendBufferSize", self.send_buffer_size, &limits::SEND_BUFFER_SIZE),
            check("maxMessageSize", self.max_message_size, &limits::MAX_MESSAGE_SIZE),
        ];
        if self.heartbeat_enabled {
            checks.push(check(
                "pingIntervalMs",
                self.ping_interval_ms,
                &limits::PING_INTERVAL_MS,
            ));
            checks.push(check(
                "pongTimeoutMs",
                self.pong_timeout_ms,
                &limits::PONG_TIMEOUT_MS,
            ));
        }
        if self.health_sweep_enabled {
            checks.push(check(
                "healthSweepIntervalMs",
                self.health_sweep_interval_ms,
                &limits::HEALTH_SWEEP_INTERVAL_MS,
            ));
        }
        checks
            .into_iter()
            .collect::<std::result::Result<(), String>>()
            .map_err(SettingsError::InvalidValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_profile() {
        let g = GatewaySettings::default();
        assert_eq!(g.max_connections, 10_000);
        assert_eq!(g.ping_interval_ms, 30_000);
        assert_eq!(g.pong_timeout_ms, 5_000);
        assert_eq!(g.message_queue_size, 100);
        assert_eq!(g.health_sweep_interval_ms, 60_000);
        assert!(g.heartbeat_enabled);
        assert!(!g.hardened);
        assert_eq!(g.path, "/ws");
    }

    #[test]
    fn allowed_origins_deserialize() {
        let g: GatewaySettings = serde_json::from_str(
            r#"{"hardened": true, "allowedOrigins": ["https://app.example"]}"#,
        )
        .unwrap();
        assert!(g.hardened);
        assert_eq!(g.allowed_origins, vec!["https://app.example".to_string()]);
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(GatewaySettings::default().validate().is_ok());
    }

    #[test]
    fn oversized_capacity_rejected() {
        let g = GatewaySettings {
            max_connections: usize::MAX,
            ..GatewaySettings::default()
        };
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("maxConnections"));
    }

    #[test]
    fn zero_stale_multiplier_rejected() {
        let g = GatewaySettings {
            stale_multiplier: 0,
            ..GatewaySettings::default()
        };
        assert!(g.validate().unwrap_err().to_string().contains("staleMultiplier"));
    }

    #[test]
    fn huge_intervals_rejected() {
        let g = GatewaySettings {
            ping_interval_ms: u64::MAX,
            ..GatewaySettings::default()
        };
        assert!(g.validate().is_err());

        let g = GatewaySettings {
            health_sweep_interval_ms: u64::MAX,
            ..GatewaySettings::default()
        };
        assert!(g.validate().is_err());
    }

    #[test]
    fn disabled_timers_skip_interval_checks() {
        let g = GatewaySettings {
            ping_interval_ms: 0,
            heartbeat_enabled: false,
            health_sweep_interval_ms: 0,
            health_sweep_enabled: false,
            ..GatewaySettings::default()
        };
        assert!(g.validate().is_ok());
    }

    #[test]
    fn range_check_message_names_setting() {
        let err = limits::check("pongTimeoutMs", 5, &limits::PONG_TIMEOUT_MS).unwrap_err();
        assert_eq!(err, "pongTimeoutMs must be between 100 and 600000, got 5");
    }
}

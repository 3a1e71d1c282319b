//! Validated runtime configuration for the gateway.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::time::Duration;

use relay_settings::{GatewaySettings, limits};

use crate::error::{GatewayError, Result};

/// Gateway configuration with durations resolved.
///
/// Built from [`GatewaySettings`] via [`GatewayConfig::from_settings`], which
/// also runs [`GatewayConfig::validate`].
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Upgrade path for WebSocket connections.
    pub path: String,
    /// Hard cap on live connections.
    pub max_connections: usize,
    /// Heartbeat probe cadence.
    pub ping_interval: Duration,
    /// Deadline for a pong after each probe.
    pub pong_timeout: Duration,
    /// Per-connection outbound queue bound.
    pub message_queue_size: usize,
    /// Reported only; the transport cannot negotiate permessage-deflate.
    pub compression_enabled: bool,
    /// Run the per-connection heartbeat monitor.
    pub heartbeat_enabled: bool,
    /// Run the periodic health sweep.
    pub health_sweep_enabled: bool,
    /// Health sweep cadence.
    pub health_sweep_interval: Duration,
    /// Multiplier on `pong_timeout` in the sweep staleness threshold.
    pub stale_multiplier: u32,
    /// Error count above which the sweep terminates a connection.
    pub max_error_count: u64,
    /// Enforce the origin allow-list.
    pub hardened: bool,
    /// Origins accepted in hardened mode.
    pub allowed_origins: Vec<String>,
    /// Bounded wait for connection tasks during shutdown.
    pub shutdown_grace: Duration,
    /// Frames buffered between a connection and its socket writer.
    pub send_buffer_size: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl GatewayConfig {
    /// Convert and validate file/env settings.
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self> {
        let config = Self {
            path: settings.path.clone(),
            max_connections: settings.max_connections,
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.pong_timeout_ms),
            message_queue_size: settings.message_queue_size,
            compression_enabled: settings.compression_enabled,
            heartbeat_enabled: settings.heartbeat_enabled,
            health_sweep_enabled: settings.health_sweep_enabled,
            health_sweep_interval: Duration::from_millis(settings.health_sweep_interval_ms),
            stale_multiplier: settings.stale_multiplier,
            max_error_count: settings.max_error_count,
            hardened: settings.hardened,
            allowed_origins: settings.allowed_origins.clone(),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            send_buffer_size: settings.send_buffer_size,
            max_message_size: settings.max_message_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with.
    ///
    /// Uses the same ranges as the settings layers, so a config built by
    /// hand gets the same bounds as one loaded from a file.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(invalid(format!("path must start with '/': {}", self.path)));
        }
        check("maxConnections", self.max_connections, &limits::MAX_CONNECTIONS)?;
        check(
            "messageQueueSize",
            self.message_queue_size,
            &limits::MESSAGE_QUEUE_SIZE,
        )?;
        check("sendBufferSize", self.send_buffer_size, &limits::SEND_BUFFER_SIZE)?;
        check("maxMessageSize", self.max_message_size, &limits::MAX_MESSAGE_SIZE)?;
        check(
            "staleMultiplier",
            self.stale_multiplier,
            &limits::STALE_MULTIPLIER,
        )?;
        check(
            "shutdownGraceMs",
            millis(self.shutdown_grace),
            &limits::SHUTDOWN_GRACE_MS,
        )?;
        if self.heartbeat_enabled {
            check(
                "pingIntervalMs",
                millis(self.ping_interval),
                &limits::PING_INTERVAL_MS,
            )?;
            check(
                "pongTimeoutMs",
                millis(self.pong_timeout),
                &limits::PONG_TIMEOUT_MS,
            )?;
        }
        if self.health_sweep_enabled {
            check(
                "healthSweepIntervalMs",
                millis(self.health_sweep_interval),
                &limits::HEALTH_SWEEP_INTERVAL_MS,
            )?;
        }
        Ok(())
    }

    /// Time without a pong after which the health sweep calls a peer stale.
    pub fn stale_after(&self) -> Duration {
        self.ping_interval
            .saturating_add(self.pong_timeout.saturating_mul(self.stale_multiplier))
    }

    /// Worst-case heartbeat detection window after the last pong.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.ping_interval.saturating_add(self.pong_timeout)
    }

    /// Whether `origin` passes the allow-list.
    ///
    /// Only enforced in hardened mode with a non-empty list. A missing or
    /// empty origin is allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.hardened || self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            None | Some("") => true,
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let settings = GatewaySettings::default();
        Self {
            path: settings.path,
            max_connections: settings.max_connections,
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.pong_timeout_ms),
            message_queue_size: settings.message_queue_size,
            compression_enabled: settings.compression_enabled,
            heartbeat_enabled: settings.heartbeat_enabled,
            health_sweep_enabled: settings.health_sweep_enabled,
            health_sweep_interval: Duration::from_millis(settings.health_sweep_interval_ms),
            stale_multiplier: settings.stale_multiplier,
            max_error_count: settings.max_error_count,
            hardened: settings.hardened,
            allowed_origins: settings.allowed_origins,
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            send_buffer_size: settings.send_buffer_size,
            max_message_size: settings.max_message_size,
        }
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::InvalidConfig(msg.into())
}

fn check<T>(name: &str, value: T, range: &RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + Display,
{
    limits::check(name, value, range).map_err(invalid)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

//! Connection identity, health records and the transport seam.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque connection identifier, `conn_<uuid-v7>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new unique ID.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// Borrow the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Registered, transport not yet confirmed open.
    Connecting,
    /// Open and eligible for delivery and heartbeats.
    Connected,
    /// Terminal.
    Disconnected,
}

/// Heartbeat probe state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    /// No probe outstanding.
    Idle,
    /// A ping was sent and no pong has arrived yet.
    AwaitingPong,
}

/// Round-trip time above which a connection no longer counts as healthy.
pub const SLOW_LATENCY: Duration = Duration::from_secs(10);

/// Liveness and traffic counters for one connection.
#[derive(Clone, Debug)]
pub struct ConnectionHealth {
    /// When the connection was registered.
    pub connected_at: Instant,
    /// Wall-clock registration time, ms since epoch.
    pub connected_at_ms: i64,
    /// Most recent heartbeat probe.
    pub last_ping_sent_at: Option<Instant>,
    /// Most recent pong (starts at `connected_at`).
    pub last_pong_received_at: Instant,
    /// Frames written to the transport.
    pub messages_sent: u64,
    /// Inbound text frames received.
    pub messages_received: u64,
    /// Write failures and malformed inbound frames.
    pub error_count: u64,
    /// Probe state.
    pub heartbeat: HeartbeatState,
    /// Ping-to-pong round trip of the last answered probe.
    pub latency: Option<Duration>,
}

impl ConnectionHealth {
    /// Fresh health record stamped with the current time.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            connected_at_ms: crate::message::now_millis(),
            last_ping_sent_at: None,
            last_pong_received_at: now,
            messages_sent: 0,
            messages_received: 0,
            error_count: 0,
            heartbeat: HeartbeatState::Idle,
            latency: None,
        }
    }

    /// Record an outgoing probe.
    pub fn ping_sent(&mut self, at: Instant) {
        self.last_ping_sent_at = Some(at);
        self.heartbeat = HeartbeatState::AwaitingPong;
    }

    /// Record a pong. Only a pong answering an outstanding probe updates
    /// the latency.
    pub fn pong_received(&mut self, at: Instant) {
        if let (HeartbeatState::AwaitingPong, Some(sent)) =
            (self.heartbeat, self.last_ping_sent_at)
        {
            self.latency = Some(at.saturating_duration_since(sent));
        }
        self.last_pong_received_at = at;
        self.heartbeat = HeartbeatState::Idle;
    }

    /// Time since the last pong as of `now`.
    pub fn since_last_pong(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_pong_received_at)
    }

    /// Last measured latency in whole milliseconds.
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Whether the last measured round trip exceeded [`SLOW_LATENCY`].
    pub fn is_slow(&self) -> bool {
        self.latency.is_some_and(|d| d > SLOW_LATENCY)
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// What the gateway knows about the remote peer.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Remote socket address.
    pub remote_addr: Option<SocketAddr>,
    /// Application user, from the `userId` query parameter.
    pub user_id: Option<String>,
    /// Declared `Origin` header.
    pub origin: Option<String>,
}

/// Point-in-time copy of a registry entry.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Connection ID.
    pub id: ConnectionId,
    /// Lifecycle state.
    pub status: ConnectionStatus,
    /// Peer details.
    pub peer: PeerInfo,
    /// Registration time, ms since epoch.
    pub connected_at: i64,
    /// Milliseconds since the last pong.
    pub ms_since_last_pong: u64,
    /// Probe state.
    pub heartbeat: HeartbeatState,
    /// Round trip of the last answered ping, if any.
    pub latency_ms: Option<u64>,
    /// Frames written to the transport.
    pub messages_sent: u64,
    /// Inbound text frames received.
    pub messages_received: u64,
    /// Error counter.
    pub error_count: u64,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
    /// Messages evicted from the outbound queue.
    pub evicted: u64,
    /// Subscribed channels.
    pub channels: BTreeSet<String>,
    /// Whether the transport still reports itself open.
    pub transport_open: bool,
}

/// Why a non-blocking write was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The writer's buffer is full.
    #[error("transport buffer full")]
    Full,
    /// The transport is closed.
    #[error("transport closed")]
    Closed,
}

/// Write side of a peer connection, owned by its registry entry.
///
/// All methods are non-blocking so they can run while the entry is locked.
pub trait Transport: Send + Sync + 'static {
    /// Queue a text frame for writing.
    fn try_send(&self, frame: Arc<str>) -> Result<(), TransportError>;
    /// Queue a protocol-level ping. Returns `false` if it could not be queued.
    fn ping(&self) -> bool;
    /// Whether the transport is open.
    fn is_open(&self) -> bool;
    /// Whether a frame can be written right now without blocking.
    fn is_writable(&self) -> bool;
    /// Close with `code`. `backlog` is written ahead of the close frame.
    ///
    /// Code 1006 drops the socket without a close frame and is always
    /// called with an empty backlog.
    fn close(&self, code: u16, reason: &str, backlog: Vec<Arc<str>>);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_prefixed_and_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(a.as_str().starts_with("conn_"));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_str());
    }

    #[test]
    fn connection_id_serializes_as_string() {
        let id = ConnectionId::from("conn_x");
        assert_eq!(serde_json::to_value(&id).unwrap(), "conn_x");
    }

    #[tokio::test(start_paused = true)]
    async fn health_starts_idle_with_pong_at_connect() {
        let health = ConnectionHealth::new();
        assert_eq!(health.heartbeat, HeartbeatState::Idle);
        assert_eq!(health.last_pong_received_at, health.connected_at);
        assert!(health.last_ping_sent_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_pong_transitions() {
        let mut health = ConnectionHealth::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        let sent = Instant::now();
        health.ping_sent(sent);
        assert_eq!(health.heartbeat, HeartbeatState::AwaitingPong);
        assert_eq!(health.last_ping_sent_at, Some(sent));

        tokio::time::advance(Duration::from_millis(200)).await;
        health.pong_received(Instant::now());
        assert_eq!(health.heartbeat, HeartbeatState::Idle);
        assert_eq!(health.since_last_pong(Instant::now()), Duration::ZERO);
        assert_eq!(health.latency_ms(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_pong_keeps_latency() {
        let mut health = ConnectionHealth::new();
        health.pong_received(Instant::now());
        assert_eq!(health.latency, None);

        health.ping_sent(Instant::now());
        tokio::time::advance(Duration::from_millis(40)).await;
        health.pong_received(Instant::now());
        tokio::time::advance(Duration::from_secs(30)).await;
        health.pong_received(Instant::now());
        assert_eq!(health.latency_ms(), Some(40));
        assert!(!health.is_slow());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_round_trip_flagged() {
        let mut health = ConnectionHealth::new();
        health.ping_sent(Instant::now());
        tokio::time::advance(SLOW_LATENCY + Duration::from_millis(1)).await;
        health.pong_received(Instant::now());
        assert!(health.is_slow());
        assert_eq!(health.latency_ms(), Some(10_001));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Connecting).unwrap(),
            "connecting"
        );
        assert_eq!(
            serde_json::to_value(HeartbeatState::AwaitingPong).unwrap(),
            "awaiting_pong"
        );
    }
}

//! Wire envelope and protocol constants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message types owned by the gateway. Everything else is application-defined.
pub mod types {
    /// Client liveness probe.
    pub const PING: &str = "ping";
    /// Reply to [`PING`].
    pub const PONG: &str = "pong";
    /// Join a named channel.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Leave a named channel.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// First frame on every accepted connection.
    pub const WELCOME: &str = "welcome";
    /// Sent to all peers before the gateway closes them.
    pub const SHUTDOWN: &str = "shutdown";
    /// Reply to a malformed inbound frame.
    pub const ERROR: &str = "error";
    /// Reply to [`SUBSCRIBE`].
    pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
    /// Reply to [`UNSUBSCRIBE`].
    pub const UNSUBSCRIPTION_CONFIRMED: &str = "unsubscription_confirmed";
}

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away (shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure. Never written on the wire; the socket is dropped.
    pub const ABNORMAL: u16 = 1006;
    /// Policy violation.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Outbound message envelope.
///
/// `timestamp` is assigned by the dispatcher when the message is sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID.
    pub id: String,
    /// Type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    /// Create an unstamped message with a fresh ID.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            id: format!("msg_{}", Uuid::now_v7()),
            kind: kind.into(),
            data,
            timestamp: 0,
        }
    }

    /// Set the send timestamp to now.
    pub fn stamp(&mut self) {
        self.timestamp = now_millis();
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Inbound envelope. Only `type` is required.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload, `null` when absent.
    #[serde(default)]
    pub data: Value,
    /// Client-assigned timestamp, if any.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Client-assigned ID, if any.
    #[serde(default)]
    pub id: Option<String>,
}

impl Envelope {
    /// Parse a text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// `data.channel` as a non-empty string.
    pub fn channel(&self) -> Option<&str> {
        self.data
            .get("channel")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

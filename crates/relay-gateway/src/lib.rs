//! # relay-gateway
//!
//! Real-time WebSocket connection gateway.
//!
//! - Admission control: connection cap and origin allow-list ahead of the upgrade
//! - Connection registry: one entry per peer owning transport, health, queue and timers
//! - Heartbeat monitor and periodic health sweep
//! - Queued delivery with drop-oldest eviction, broadcast and targeted sends
//! - Graceful shutdown via `CancellationToken` + `TaskTracker`
//! - Axum server with `/health`, `/stats` and `/metrics`

#![deny(unsafe_code)]

pub mod admission;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod health;
pub mod heartbeat;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod sweep;
pub mod websocket;

pub use admission::{AdmissionControl, AdmissionPermit, Rejection};
pub use config::GatewayConfig;
pub use connection::{
    ConnectionHealth, ConnectionId, ConnectionSnapshot, ConnectionStatus, HeartbeatState,
    PeerInfo, Transport, TransportError,
};
pub use dispatcher::{BroadcastReport, Delivery};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, InboundMessage};
pub use message::{Envelope, Message};
pub use server::GatewayServer;
pub use stats::ConnectionStats;

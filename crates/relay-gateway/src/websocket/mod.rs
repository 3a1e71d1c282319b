//! WebSocket transport, inbound frame handling and per-connection sessions.

pub mod handler;
pub mod session;
pub mod transport;

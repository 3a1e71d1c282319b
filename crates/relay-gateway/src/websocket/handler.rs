//! Inbound frame handling: gateway protocol messages and the inbound stream.

use axum::extract::ws::Message as WsMessage;
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::connection::ConnectionId;
use crate::gateway::{Gateway, InboundMessage};
use crate::message::{Envelope, Message, types};
use crate::metrics::WS_INBOUND_ERRORS_TOTAL;

/// What the session loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep reading.
    Continue,
    /// The peer sent a close frame.
    Close,
}

/// Handle one inbound WebSocket frame.
pub fn handle_frame(
    gateway: &Gateway,
    id: &ConnectionId,
    user_id: Option<&str>,
    frame: WsMessage,
) -> FrameOutcome {
    match frame {
        WsMessage::Text(text) => handle_text(gateway, id, user_id, text.as_str()),
        WsMessage::Binary(data) => {
            if let Ok(text) = std::str::from_utf8(&data) {
                handle_text(gateway, id, user_id, text);
            } else {
                let _ = gateway.registry().record_inbound(id);
                reject(gateway, id, "invalid message format");
                debug!(conn_id = %id, len = data.len(), "non-UTF8 binary frame");
            }
        }
        WsMessage::Pong(_) => {
            let _ = gateway.registry().record_pong(id);
        }
        // Answered by the protocol layer.
        WsMessage::Ping(_) => {}
        WsMessage::Close(frame) => {
            debug!(
                conn_id = %id,
                code = frame.as_ref().map(|f| f.code),
                "peer sent close frame"
            );
            return FrameOutcome::Close;
        }
    }
    FrameOutcome::Continue
}

/// Handle one inbound text frame.
pub fn handle_text(gateway: &Gateway, id: &ConnectionId, user_id: Option<&str>, text: &str) {
    let _ = gateway.registry().record_inbound(id);

    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(conn_id = %id, error = %e, len = text.len(), "malformed inbound frame");
            reject(gateway, id, "invalid message format");
            return;
        }
    };
    trace!(conn_id = %id, kind = %envelope.kind, "inbound message");

    match envelope.kind.as_str() {
        types::PING => {
            let timestamp = envelope
                .data
                .get("timestamp")
                .cloned()
                .or_else(|| envelope.timestamp.map(Value::from))
                .unwrap_or(Value::Null);
            let _ = gateway.send(id, Message::new(types::PONG, json!({ "timestamp": timestamp })));
        }
        types::PONG => {
            let _ = gateway.registry().record_pong(id);
        }
        types::SUBSCRIBE => {
            let Some(channel) = envelope.channel() else {
                reject(gateway, id, "channel required");
                return;
            };
            let _ = gateway.registry().subscribe(id, channel);
            debug!(conn_id = %id, channel, "subscribed");
            let _ = gateway.send(
                id,
                Message::new(types::SUBSCRIPTION_CONFIRMED, json!({ "channel": channel })),
            );
        }
        types::UNSUBSCRIBE => {
            let Some(channel) = envelope.channel() else {
                reject(gateway, id, "channel required");
                return;
            };
            let _ = gateway.registry().unsubscribe(id, channel);
            debug!(conn_id = %id, channel, "unsubscribed");
            let _ = gateway.send(
                id,
                Message::new(types::UNSUBSCRIPTION_CONFIRMED, json!({ "channel": channel })),
            );
        }
        _ => gateway.publish_inbound(InboundMessage {
            connection_id: id.clone(),
            user_id: user_id.map(str::to_owned),
            envelope,
        }),
    }
}

/// Count an inbound error and tell the peer. The connection stays open.
fn reject(gateway: &Gateway, id: &ConnectionId, message: &str) {
    let _ = gateway.registry().record_error(id);
    counter!(WS_INBOUND_ERRORS_TOTAL).increment(1);
    let _ = gateway.send(id, Message::new(types::ERROR, json!({ "message": message })));
}

//! WebSocket session lifecycle: one admitted peer from upgrade through
//! termination.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::handler::{FrameOutcome, handle_frame};
use super::transport::{ChannelTransport, run_writer};
use crate::admission::AdmissionPermit;
use crate::connection::{ConnectionId, ConnectionStatus, PeerInfo, Transport};
use crate::gateway::Gateway;
use crate::message::{Message, close_code, types};

/// Run a WebSocket session for an admitted peer.
///
/// 1. Registers the connection and starts its writer and flush tasks
/// 2. Sends `welcome` with the connection ID, then marks it connected
/// 3. Handles inbound frames until the peer leaves or the gateway terminates it
/// 4. Waits for the writer to finish the close handshake
#[instrument(skip_all, fields(conn_id))]
pub async fn run_session(
    gateway: Gateway,
    mut socket: WebSocket,
    permit: AdmissionPermit,
    peer: PeerInfo,
) {
    let config = gateway.config();
    let (transport, out_rx, close_rx) = ChannelTransport::new(config.send_buffer_size);
    let user_id = peer.user_id.clone();
    let remote = peer.remote_addr;

    let reg = match gateway.register_connection(permit, transport.clone(), peer) {
        Ok(reg) => reg,
        Err(rejection) => {
            debug!(reason = rejection.reason(), "registration refused after upgrade");
            let frame = CloseFrame {
                code: close_code::GOING_AWAY,
                reason: "going away".into(),
            };
            let _ = socket.send(WsMessage::Close(Some(frame))).await;
            return;
        }
    };
    let _ = tracing::Span::current().record("conn_id", reg.id.as_str());
    info!(remote = ?remote, user_id = user_id.as_deref(), "client connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = gateway.spawn_task(run_writer(
        ws_tx,
        out_rx,
        close_rx,
        Arc::clone(&transport),
        gateway.force_token(),
    ));
    let _ = gateway.spawn_task(run_flusher(
        gateway.clone(),
        reg.id.clone(),
        Arc::clone(&transport),
        Arc::clone(&reg.backlog),
        reg.cancel.clone(),
    ));

    // Queued while Connecting, written by mark_connected.
    let _ = gateway.send(
        &reg.id,
        Message::new(types::WELCOME, json!({ "connectionId": reg.id })),
    );
    let _ = gateway.mark_connected(&reg.id);

    let ended = loop {
        tokio::select! {
            () = reg.cancel.cancelled() => break None,
            frame = ws_rx.next() => match frame {
                Some(Ok(frame)) => {
                    if handle_frame(&gateway, &reg.id, user_id.as_deref(), frame) == FrameOutcome::Close {
                        break Some((close_code::NORMAL, "normal closure"));
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read error");
                    break Some((close_code::ABNORMAL, "transport error"));
                }
                None => break Some((close_code::ABNORMAL, "connection lost")),
            }
        }
    };

    if let Some((code, reason)) = ended {
        let _ = gateway.terminate(&reg.id, code, reason);
    }
    let _ = writer.await;
    info!(by_peer = ended.is_some(), "client disconnected");
}

/// Flush the backlog whenever something is queued and the writer has room.
async fn run_flusher(
    gateway: Gateway,
    id: ConnectionId,
    transport: Arc<ChannelTransport>,
    backlog: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = backlog.notified() => {}
        }
        loop {
            let ready = tokio::select! {
                () = cancel.cancelled() => return,
                ready = transport.writable() => ready,
            };
            if !ready || !transport.is_open() {
                return;
            }
            let Some(flushed) = gateway.flush(&id) else {
                return;
            };
            match gateway.registry().queue_len(&id) {
                None => return,
                Some(0) => break,
                // mark_connected drains what is queued while Connecting.
                Some(_)
                    if flushed == 0
                        && gateway.registry().status(&id) != Some(ConnectionStatus::Connected) =>
                {
                    break;
                }
                Some(_) => tokio::task::yield_now().await,
            }
        }
    }
}

//! Channel-backed transport and the socket writer task.
//!
//! The registry only ever talks to [`ChannelTransport`], whose methods never
//! block. A dedicated writer task owns the socket sink and drains the
//! channel; the channel capacity is the writability signal.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage};
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Transport, TransportError};
use crate::message::close_code;

/// One item for the writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(Arc<str>),
    /// Protocol-level ping.
    Ping,
}

/// Request to close the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseSignal {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Queued frames to write before the close frame.
    pub backlog: Vec<Arc<str>>,
}

/// Non-blocking transport feeding a writer task through a bounded channel.
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    close_tx: Mutex<Option<oneshot::Sender<CloseSignal>>>,
    open: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport with `buffer` slots, plus the writer's receivers.
    pub fn new(
        buffer: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Outbound>,
        oneshot::Receiver<CloseSignal>,
    ) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let transport = Arc::new(Self {
            tx,
            close_tx: Mutex::new(Some(close_tx)),
            open: AtomicBool::new(true),
        });
        (transport, rx, close_rx)
    }

    /// Wait until a frame can be accepted. `false` once the writer is gone.
    pub async fn writable(&self) -> bool {
        self.is_open() && self.tx.reserve().await.is_ok()
    }

    /// Record that the socket can no longer be written.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Transport for ChannelTransport {
    fn try_send(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx
            .try_send(Outbound::Text(frame))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Full,
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    fn ping(&self) -> bool {
        self.is_open() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.tx.capacity() > 0
    }

    fn close(&self, code: u16, reason: &str, backlog: Vec<Arc<str>>) {
        self.mark_closed();
        if let Some(close_tx) = self.close_tx.lock().take() {
            let _ = close_tx.send(CloseSignal {
                code,
                reason: reason.to_owned(),
                backlog,
            });
        }
    }
}

/// Own the socket sink until close, write error or `force`.
///
/// On a close signal, frames already accepted are written first, then the
/// signal's backlog, then a close frame. Code 1006 skips the close frame and
/// just drops the socket.
pub async fn run_writer<S>(
    sink: S,
    rx: mpsc::Receiver<Outbound>,
    close_rx: oneshot::Receiver<CloseSignal>,
    transport: Arc<ChannelTransport>,
    force: CancellationToken,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    tokio::select! {
        () = force.cancelled() => debug!("writer forced to stop"),
        () = write_loop(sink, rx, close_rx) => {}
    }
    transport.mark_closed();
}

async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    mut close_rx: oneshot::Receiver<CloseSignal>,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            signal = &mut close_rx => {
                let Ok(signal) = signal else { return };
                while let Ok(item) = rx.try_recv() {
                    if write(&mut sink, item).await.is_err() {
                        return;
                    }
                }
                for frame in signal.backlog {
                    if write(&mut sink, Outbound::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if signal.code != close_code::ABNORMAL {
                    let frame = CloseFrame {
                        code: signal.code,
                        reason: signal.reason.into(),
                    };
                    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                        trace!(error = %e, "close frame not delivered");
                    }
                }
                return;
            }
            item = rx.recv() => {
                let Some(item) = item else { return };
                if write(&mut sink, item).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write<S>(sink: &mut S, item: Outbound) -> Result<(), ()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let message = match item {
        Outbound::Text(frame) => WsMessage::Text(String::from(&*frame).into()),
        Outbound::Ping => WsMessage::Ping(Bytes::new()),
    };
    sink.send(message).await.map_err(|e| {
        debug!(error = %e, "socket write failed");
    })
}

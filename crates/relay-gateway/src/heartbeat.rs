//! Per-connection heartbeat monitor.
//!
//! Every `interval` a `Connected` peer gets a protocol ping. If no pong
//! arrives within `timeout` of that ping the connection is terminated with
//! 1006, so a silent peer is dropped at most `interval + timeout` after its
//! last pong.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::message::close_code;
use crate::metrics::WS_HEARTBEAT_TIMEOUTS_TOTAL;
use crate::registry::{ConnectionRegistry, PingOutcome};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer missed a pong deadline and was terminated.
    TimedOut,
    /// The connection's token was cancelled.
    Cancelled,
    /// The connection left the registry on another path.
    Gone,
}

/// Run heartbeat probes for one connection until it ends.
pub async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {}
        }

        match registry.begin_ping(&id) {
            PingOutcome::Sent => {}
            PingOutcome::Skipped => continue,
            PingOutcome::Gone => return HeartbeatResult::Gone,
        }

        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = time::sleep(timeout) => {}
        }

        match registry.awaiting_pong(&id) {
            Some(false) => {}
            Some(true) => {
                counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                debug!(conn_id = %id, timeout_ms = timeout.as_millis(), "heartbeat timeout");
                let _ = registry.terminate(&id, close_code::ABNORMAL, "heartbeat timeout");
                return HeartbeatResult::TimedOut;
            }
            None => return HeartbeatResult::Gone,
        }
    }
}

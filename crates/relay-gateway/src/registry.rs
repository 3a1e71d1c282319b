//! Connection registry: the authoritative table of live connections.
//!
//! Each entry owns its transport, health record, outbound queue, channel set,
//! cancellation token and admission permit. Removing the entry in
//! [`ConnectionRegistry::terminate`] releases all of them at once, so a
//! concurrent send sees either the whole record or nothing.
//!
//! Never hold an entry guard while calling back into the map.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::admission::{AdmissionPermit, Rejection};
use crate::config::GatewayConfig;
use crate::connection::{
    ConnectionHealth, ConnectionId, ConnectionSnapshot, ConnectionStatus, HeartbeatState,
    PeerInfo, Transport,
};
use crate::dispatcher;
use crate::heartbeat;
use crate::message::close_code;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::queue::OutboundQueue;
use crate::stats::ConnectionStats;
use crate::sweep::SweepReason;

/// One registered connection.
pub(crate) struct ConnectionEntry {
    pub(crate) id: ConnectionId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) peer: PeerInfo,
    pub(crate) status: ConnectionStatus,
    pub(crate) health: ConnectionHealth,
    pub(crate) queue: OutboundQueue<Arc<str>>,
    pub(crate) channels: BTreeSet<String>,
    pub(crate) cancel: CancellationToken,
    pub(crate) backlog: Arc<Notify>,
    _permit: AdmissionPermit,
}

impl ConnectionEntry {
    fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            status: self.status,
            peer: self.peer.clone(),
            connected_at: self.health.connected_at_ms,
            ms_since_last_pong: u64::try_from(self.health.since_last_pong(now).as_millis())
                .unwrap_or(u64::MAX),
            heartbeat: self.health.heartbeat,
            latency_ms: self.health.latency_ms(),
            messages_sent: self.health.messages_sent,
            messages_received: self.health.messages_received,
            error_count: self.health.error_count,
            queued: self.queue.len(),
            evicted: self.queue.evicted(),
            channels: self.channels.clone(),
            transport_open: self.transport.is_open(),
        }
    }
}

/// Handles returned to the owner of a newly registered connection.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Assigned connection ID.
    pub id: ConnectionId,
    /// Cancelled exactly once, when the connection is terminated.
    pub cancel: CancellationToken,
    /// Notified whenever a message is queued for this connection.
    pub backlog: Arc<Notify>,
}

/// Result of a heartbeat probe attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PingOutcome {
    Sent,
    Skipped,
    Gone,
}

/// Authoritative table of live connections.
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    config: Arc<GatewayConfig>,
    root: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    lifetime: AtomicU64,
    dropped: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    ///
    /// Per-connection tokens are children of `root`; heartbeat tasks are
    /// spawned on `tracker`.
    pub fn new(config: Arc<GatewayConfig>, root: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            root,
            tracker,
            closed: AtomicBool::new(false),
            lifetime: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register an admitted connection in the `Connecting` state.
    ///
    /// Starts the heartbeat monitor when enabled. Fails only once shutdown
    /// has begun draining the registry.
    pub fn register(
        self: &Arc<Self>,
        permit: AdmissionPermit,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
    ) -> Result<Registration, Rejection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Rejection::ShuttingDown);
        }

        let id = ConnectionId::new();
        let cancel = self.root.child_token();
        let backlog = Arc::new(Notify::new());
        let entry = ConnectionEntry {
            id: id.clone(),
            transport,
            peer,
            status: ConnectionStatus::Connecting,
            health: ConnectionHealth::new(),
            queue: OutboundQueue::new(self.config.message_queue_size),
            channels: BTreeSet::new(),
            cancel: cancel.clone(),
            backlog: Arc::clone(&backlog),
            _permit: permit,
        };
        let _ = self.entries.insert(id.clone(), entry);
        let _ = self.lifetime.fetch_add(1, Ordering::Relaxed);
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        debug!(conn_id = %id, "connection registered");

        // Lost a race with terminate_all.
        if self.closed.load(Ordering::SeqCst) {
            let _ = self.terminate(&id, close_code::GOING_AWAY, "going away");
            return Err(Rejection::ShuttingDown);
        }

        if self.config.heartbeat_enabled {
            let _ = self.tracker.spawn(heartbeat::run_heartbeat(
                Arc::clone(self),
                id.clone(),
                self.config.ping_interval,
                self.config.pong_timeout,
                cancel.clone(),
            ));
        }

        Ok(Registration {
            id,
            cancel,
            backlog,
        })
    }

    /// Move `Connecting` to `Connected` and flush anything queued meanwhile.
    pub fn mark_connected(&self, id: &ConnectionId) -> bool {
        self.with_entry_mut(id, |entry| {
            if entry.status == ConnectionStatus::Connecting {
                entry.status = ConnectionStatus::Connected;
            }
            let flushed = dispatcher::drain(entry);
            trace!(conn_id = %id, flushed, "connection marked connected");
        })
        .is_some()
    }

    /// Snapshot of one connection.
    pub fn lookup(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let now = Instant::now();
        self.entries.get(id).map(|entry| entry.snapshot(now))
    }

    /// Lifecycle state of one connection.
    pub fn status(&self, id: &ConnectionId) -> Option<ConnectionStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove a connection and release everything it owns.
    ///
    /// Closes the transport with `code`, cancels its timers and frees its
    /// admission slot. Queued messages go out ahead of the close frame,
    /// except for 1006 where the socket is dropped and the queue discarded.
    /// Returns `false` if it was already gone.
    pub fn terminate(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        let Some((_, mut entry)) = self.entries.remove(id) else {
            return false;
        };
        entry.status = ConnectionStatus::Disconnected;
        entry.cancel.cancel();
        let (backlog, discarded) = if code == close_code::ABNORMAL {
            (Vec::new(), entry.queue.clear())
        } else {
            (entry.queue.take_all(), 0)
        };
        let handed_over = backlog.len();
        entry.transport.close(code, reason, backlog);

        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS)
            .record(entry.health.connected_at.elapsed().as_secs_f64());
        debug!(
            conn_id = %id,
            code,
            reason,
            handed_over,
            discarded,
            "connection terminated"
        );
        true
    }

    /// Terminate every connection and refuse further registrations.
    pub fn terminate_all(&self, code: u16, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.ids()
            .iter()
            .filter(|id| self.terminate(id, code, reason))
            .count()
    }

    /// Record a pong (transport or protocol level).
    pub fn record_pong(&self, id: &ConnectionId) -> bool {
        let now = Instant::now();
        self.with_entry_mut(id, |entry| entry.health.pong_received(now))
            .is_some()
    }

    /// Count an inbound frame.
    pub fn record_inbound(&self, id: &ConnectionId) -> bool {
        self.with_entry_mut(id, |entry| entry.health.messages_received += 1)
            .is_some()
    }

    /// Count an error. Returns the new error count.
    pub fn record_error(&self, id: &ConnectionId) -> Option<u64> {
        self.with_entry_mut(id, |entry| {
            entry.health.error_count += 1;
            entry.health.error_count
        })
    }

    /// Add `channel` to the connection's set. `Some(false)` if already present.
    pub fn subscribe(&self, id: &ConnectionId, channel: &str) -> Option<bool> {
        self.with_entry_mut(id, |entry| entry.channels.insert(channel.to_owned()))
    }

    /// Remove `channel` from the connection's set. `Some(false)` if absent.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) -> Option<bool> {
        self.with_entry_mut(id, |entry| entry.channels.remove(channel))
    }

    /// IDs of all registered connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Connections opened by `user_id`.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|e| e.peer.user_id.as_deref() == Some(user_id))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Connections subscribed to `channel`.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|e| e.channels.contains(channel))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Queued message count for one connection.
    pub fn queue_len(&self, id: &ConnectionId) -> Option<usize> {
        self.entries.get(id).map(|e| e.queue.len())
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Connections registered since startup.
    pub fn lifetime_connections(&self) -> u64 {
        self.lifetime.load(Ordering::Relaxed)
    }

    /// Queue evictions since startup.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Aggregate statistics over live connections.
    pub fn stats(&self) -> ConnectionStats {
        let now = Instant::now();
        let deadline = self.config.heartbeat_deadline();
        let mut stats = ConnectionStats {
            total_connections: 0,
            dropped_messages: self.dropped_messages(),
            lifetime_connections: self.lifetime_connections(),
            ..ConnectionStats::default()
        };

        let mut latency_total: u64 = 0;
        let mut latency_samples: u64 = 0;
        for entry in &self.entries {
            stats.total_connections += 1;
            stats.messages_sent += entry.health.messages_sent;
            stats.messages_received += entry.health.messages_received;
            stats.error_count += entry.health.error_count;
            stats.queued_messages += entry.queue.len();
            if let Some(ms) = entry.health.latency_ms() {
                latency_total = latency_total.saturating_add(ms);
                latency_samples += 1;
            }

            if entry.status != ConnectionStatus::Connected {
                continue;
            }
            stats.connected_connections += 1;

            let responsive =
                !self.config.heartbeat_enabled || entry.health.since_last_pong(now) <= deadline;
            if responsive
                && entry.transport.is_open()
                && entry.health.error_count <= self.config.max_error_count
                && !entry.health.is_slow()
            {
                stats.healthy_connections += 1;
            }
        }
        if latency_samples > 0 {
            stats.average_latency_ms = latency_total / latency_samples;
        }
        stats
    }

    pub(crate) fn note_evicted(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` against one entry under its shard lock.
    pub(crate) fn with_entry_mut<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut ConnectionEntry) -> R,
    ) -> Option<R> {
        self.entries.get_mut(id).map(|mut entry| f(&mut entry))
    }

    /// Send a heartbeat probe if the connection is `Connected`.
    pub(crate) fn begin_ping(&self, id: &ConnectionId) -> PingOutcome {
        let now = Instant::now();
        self.with_entry_mut(id, |entry| {
            if entry.status != ConnectionStatus::Connected {
                return PingOutcome::Skipped;
            }
            if !entry.transport.ping() {
                trace!(conn_id = %id, "ping could not be queued");
            }
            entry.health.ping_sent(now);
            PingOutcome::Sent
        })
        .unwrap_or(PingOutcome::Gone)
    }

    /// Whether the last probe is still unanswered. `None` if gone.
    pub(crate) fn awaiting_pong(&self, id: &ConnectionId) -> Option<bool> {
        self.entries
            .get(id)
            .map(|e| e.health.heartbeat == HeartbeatState::AwaitingPong)
    }

    /// Connections the health sweep should terminate, with the scan size.
    pub(crate) fn sweep_candidates(&self, now: Instant) -> (usize, Vec<(ConnectionId, SweepReason)>) {
        let stale_after = self.config.stale_after();
        let mut scanned = 0;
        let mut flagged = Vec::new();

        for entry in &self.entries {
            scanned += 1;
            let reason = if !entry.transport.is_open() {
                Some(SweepReason::Orphaned)
            } else if entry.health.error_count > self.config.max_error_count {
                Some(SweepReason::Errors)
            } else if self.config.heartbeat_enabled
                && entry.health.since_last_pong(now) > stale_after
            {
                Some(SweepReason::Stale)
            } else {
                None
            };
            if let Some(reason) = reason {
                flagged.push((entry.key().clone(), reason));
            }
        }
        (scanned, flagged)
    }
}

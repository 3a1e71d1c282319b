//! Single send/broadcast entry point.
//!
//! A send writes directly when the connection is `Connected`, writable and has
//! no backlog; otherwise it lands in the connection's bounded queue. The
//! backlog is always drained first, so a send never overtakes an
//! already-queued message.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionId, ConnectionStatus};
use crate::message::Message;
use crate::metrics::{WS_MESSAGES_QUEUED_TOTAL, WS_MESSAGES_SENT_TOTAL, WS_QUEUE_EVICTIONS_TOTAL};
use crate::registry::{ConnectionEntry, ConnectionRegistry};

/// Outcome of a single send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the transport.
    Delivered,
    /// Held in the outbound queue.
    Queued,
    /// No such connection.
    Unknown,
    /// The message could not be serialized, so nothing was sent.
    Unencodable,
}

/// Per-recipient tally of a fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Written immediately.
    pub delivered: usize,
    /// Queued for later delivery.
    pub queued: usize,
    /// Recipients that were not registered.
    pub skipped: usize,
    /// Recipients not attempted because the message failed to serialize.
    pub failed: usize,
}

impl BroadcastReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Queued => self.queued += 1,
            Delivery::Unknown => self.skipped += 1,
            Delivery::Unencodable => self.failed += 1,
        }
    }

    /// Recipients that were registered.
    pub fn reached(&self) -> usize {
        self.delivered + self.queued
    }
}

/// Sends and broadcasts through the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send one message to one connection.
    pub fn send(&self, id: &ConnectionId, message: Message) -> Delivery {
        match encode(message) {
            Some(frame) => self.send_frame(id, frame),
            None => Delivery::Unencodable,
        }
    }

    /// Drain the connection's queue in FIFO order until a write fails.
    ///
    /// Returns the number of messages flushed, or `None` if the connection
    /// is gone.
    pub fn flush(&self, id: &ConnectionId) -> Option<usize> {
        self.registry.with_entry_mut(id, drain)
    }

    /// Send to every registered connection. Not transactional.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        let ids = self.registry.ids();
        self.fan_out(&ids, message)
    }

    /// Send to a subset of connections. Unknown IDs are skipped.
    pub fn broadcast_to_group(&self, ids: &[ConnectionId], message: Message) -> BroadcastReport {
        self.fan_out(ids, message)
    }

    /// Send to every connection opened by `user_id`.
    pub fn send_to_user(&self, user_id: &str, message: Message) -> BroadcastReport {
        let ids = self.registry.connections_for_user(user_id);
        self.fan_out(&ids, message)
    }

    /// Send to every connection except `exclude`.
    pub fn broadcast_except(&self, message: Message, exclude: &ConnectionId) -> BroadcastReport {
        let ids: Vec<_> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| id != exclude)
            .collect();
        self.fan_out(&ids, message)
    }

    fn fan_out(&self, ids: &[ConnectionId], message: Message) -> BroadcastReport {
        let kind = message.kind.clone();
        let mut report = BroadcastReport::default();
        let Some(frame) = encode(message) else {
            report.failed = ids.len();
            return report;
        };
        for id in ids {
            report.record(self.send_frame(id, Arc::clone(&frame)));
        }
        debug!(
            kind = %kind,
            recipients = ids.len(),
            delivered = report.delivered,
            queued = report.queued,
            skipped = report.skipped,
            "broadcast"
        );
        report
    }

    fn send_frame(&self, id: &ConnectionId, frame: Arc<str>) -> Delivery {
        let Some((delivery, evicted)) = self
            .registry
            .with_entry_mut(id, |entry| deliver(entry, frame))
        else {
            trace!(conn_id = %id, "send to unknown connection");
            return Delivery::Unknown;
        };
        if evicted {
            self.registry.note_evicted();
        }
        delivery
    }
}

fn encode(mut message: Message) -> Option<Arc<str>> {
    message.stamp();
    framed(&message.kind, message.to_frame())
}

fn framed(kind: &str, result: serde_json::Result<String>) -> Option<Arc<str>> {
    match result {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(kind = %kind, error = %e, "failed to serialize message");
            None
        }
    }
}

fn writable(entry: &ConnectionEntry) -> bool {
    entry.status == ConnectionStatus::Connected && entry.transport.is_writable()
}

/// Deliver or enqueue one frame. Returns the outcome and whether an older
/// message was evicted to make room.
fn deliver(entry: &mut ConnectionEntry, frame: Arc<str>) -> (Delivery, bool) {
    let _ = drain(entry);

    if entry.queue.is_empty() && writable(entry) {
        match entry.transport.try_send(Arc::clone(&frame)) {
            Ok(()) => {
                entry.health.messages_sent += 1;
                counter!(WS_MESSAGES_SENT_TOTAL).increment(1);
                return (Delivery::Delivered, false);
            }
            Err(e) => {
                entry.health.error_count += 1;
                debug!(conn_id = %entry.id, error = %e, "write failed, queueing");
            }
        }
    }

    let evicted = entry.queue.push(frame).is_some();
    counter!(WS_MESSAGES_QUEUED_TOTAL).increment(1);
    if evicted {
        counter!(WS_QUEUE_EVICTIONS_TOTAL).increment(1);
        debug!(
            conn_id = %entry.id,
            capacity = entry.queue.capacity(),
            evicted_total = entry.queue.evicted(),
            "outbound queue full, dropped oldest"
        );
    }
    entry.backlog.notify_one();
    (Delivery::Queued, evicted)
}

/// FIFO drain of the entry's queue, stopping at the first failure.
pub(crate) fn drain(entry: &mut ConnectionEntry) -> usize {
    let mut flushed = 0;
    while writable(entry) {
        let Some(frame) = entry.queue.front() else {
            break;
        };
        match entry.transport.try_send(Arc::clone(frame)) {
            Ok(()) => {
                let _ = entry.queue.pop();
                entry.health.messages_sent += 1;
                flushed += 1;
            }
            Err(e) => {
                entry.health.error_count += 1;
                debug!(conn_id = %entry.id, error = %e, "flush stopped on write failure");
                break;
            }
        }
    }
    if flushed > 0 {
        counter!(WS_MESSAGES_SENT_TOTAL).increment(flushed as u64);
        trace!(conn_id = %entry.id, flushed, remaining = entry.queue.len(), "queue flushed");
    }
    flushed
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::admission::AdmissionControl;
    use crate::config::GatewayConfig;
    use crate::connection::PeerInfo;
    use crate::connection::testing::RecordingTransport;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        admission: AdmissionControl,
        dispatcher: Dispatcher,
    }

    fn fixture(queue_size: usize) -> Fixture {
        let config = Arc::new(GatewayConfig {
            message_queue_size: queue_size,
            heartbeat_enabled: false,
            ..GatewayConfig::default()
        });
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&config),
            CancellationToken::new(),
            TaskTracker::new(),
        ));
        Fixture {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            admission: AdmissionControl::new(config),
            registry,
        }
    }

    impl Fixture {
        fn connect(&self, user: Option<&str>) -> (ConnectionId, Arc<RecordingTransport>) {
            let transport = RecordingTransport::new();
            let peer = PeerInfo {
                user_id: user.map(str::to_owned),
                ..PeerInfo::default()
            };
            let reg = self
                .registry
                .register(self.admission.evaluate(None).unwrap(), transport.clone(), peer)
                .unwrap();
            let _ = self.registry.mark_connected(&reg.id);
            (reg.id, transport)
        }
    }

    fn numbered(n: u64) -> Message {
        Message::new("seq", json!({ "n": n }))
    }

    fn seq_numbers(transport: &RecordingTransport) -> Vec<u64> {
        transport
            .data_of("seq")
            .iter()
            .map(|d| d["n"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn send_writes_directly_when_writable() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);

        assert_eq!(fx.dispatcher.send(&id, numbered(1)), Delivery::Delivered);
        assert_eq!(seq_numbers(&transport), vec![1]);
        assert_eq!(fx.registry.lookup(&id).unwrap().messages_sent, 1);
    }

    #[tokio::test]
    async fn dispatcher_assigns_timestamp() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);
        let _ = fx.dispatcher.send(&id, Message::new("t", Value::Null));

        let frame: Value = serde_json::from_str(&transport.texts()[0]).unwrap();
        assert!(frame["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn send_to_unknown_connection() {
        let fx = fixture(10);
        let id = ConnectionId::from("conn_nope");
        assert_eq!(fx.dispatcher.send(&id, numbered(1)), Delivery::Unknown);
        assert_eq!(fx.dispatcher.flush(&id), None);
    }

    #[tokio::test]
    async fn queue_overflow_then_flush_keeps_most_recent_in_order() {
        let fx = fixture(5);
        let (id, transport) = fx.connect(None);
        transport.set_writable(false);

        for n in 1..=8 {
            assert_eq!(fx.dispatcher.send(&id, numbered(n)), Delivery::Queued);
        }
        assert_eq!(fx.registry.queue_len(&id), Some(5));
        assert_eq!(fx.registry.dropped_messages(), 3);

        transport.set_writable(true);
        assert_eq!(fx.dispatcher.flush(&id), Some(5));
        assert_eq!(seq_numbers(&transport), vec![4, 5, 6, 7, 8]);
        assert_eq!(fx.registry.queue_len(&id), Some(0));
    }

    #[tokio::test]
    async fn send_never_overtakes_backlog() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);

        transport.set_writable(false);
        let _ = fx.dispatcher.send(&id, numbered(1));
        let _ = fx.dispatcher.send(&id, numbered(2));

        transport.set_writable(true);
        // Backlog drains first, then the new message goes out.
        assert_eq!(fx.dispatcher.send(&id, numbered(3)), Delivery::Delivered);
        assert_eq!(seq_numbers(&transport), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn write_failure_queues_and_counts_error() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);
        transport.set_failing(true);

        assert_eq!(fx.dispatcher.send(&id, numbered(1)), Delivery::Queued);
        let snap = fx.registry.lookup(&id).unwrap();
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.queued, 1);

        transport.set_failing(false);
        assert_eq!(fx.dispatcher.flush(&id), Some(1));
        assert_eq!(seq_numbers(&transport), vec![1]);
    }

    #[tokio::test]
    async fn flush_stops_at_first_failure() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);
        transport.set_writable(false);
        for n in 1..=3 {
            let _ = fx.dispatcher.send(&id, numbered(n));
        }
        transport.set_writable(true);
        transport.set_failing(true);

        assert_eq!(fx.dispatcher.flush(&id), Some(0));
        assert_eq!(fx.registry.queue_len(&id), Some(3));
        assert_eq!(fx.registry.lookup(&id).unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn connecting_connections_queue_until_marked() {
        let fx = fixture(10);
        let transport = RecordingTransport::new();
        let reg = fx
            .registry
            .register(
                fx.admission.evaluate(None).unwrap(),
                transport.clone(),
                PeerInfo::default(),
            )
            .unwrap();

        assert_eq!(fx.dispatcher.send(&reg.id, numbered(1)), Delivery::Queued);
        assert!(transport.texts().is_empty());

        let _ = fx.registry.mark_connected(&reg.id);
        assert_eq!(seq_numbers(&transport), vec![1]);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_once() {
        let fx = fixture(10);
        let peers: Vec<_> = (0..3).map(|_| fx.connect(None)).collect();

        let report = fx.dispatcher.broadcast(Message::new("test", Value::Null));
        assert_eq!(report.delivered, 3);
        assert_eq!(report.reached(), 3);
        for (_, transport) in &peers {
            assert_eq!(transport.kinds(), vec!["test".to_string()]);
        }
    }

    #[tokio::test]
    async fn broadcast_counts_queued_and_delivered() {
        let fx = fixture(10);
        let (_, open) = fx.connect(None);
        let (_, blocked) = fx.connect(None);
        blocked.set_writable(false);

        let report = fx.dispatcher.broadcast(Message::new("test", Value::Null));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(open.kinds().len(), 1);
        assert!(blocked.kinds().is_empty());
    }

    #[tokio::test]
    async fn group_broadcast_skips_unknown() {
        let fx = fixture(10);
        let (a, ta) = fx.connect(None);
        let (_b, tb) = fx.connect(None);

        let ids = vec![a, ConnectionId::from("conn_gone")];
        let report = fx
            .dispatcher
            .broadcast_to_group(&ids, Message::new("group", Value::Null));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(ta.kinds(), vec!["group".to_string()]);
        assert!(tb.kinds().is_empty());
    }

    #[test]
    fn serialization_failure_is_not_a_missing_connection() {
        let mut report = BroadcastReport::default();
        report.record(Delivery::Unknown);
        report.record(Delivery::Unencodable);
        report.record(Delivery::Delivered);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.reached(), 1);
    }

    #[test]
    fn serialization_error_is_logged_and_dropped() {
        let (logs, _guard) = relay_logging::capture_logs();
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(framed("update", Err(err)).is_none());
        let lines = logs.matching("failed to serialize message");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].field("kind"), Some("update"));

        let frame = framed("update", Ok("{}".to_owned())).unwrap();
        assert_eq!(&*frame, "{}");
    }

    #[tokio::test]
    async fn send_to_user_targets_all_user_connections() {
        let fx = fixture(10);
        let (_, phone) = fx.connect(Some("u1"));
        let (_, laptop) = fx.connect(Some("u1"));
        let (_, other) = fx.connect(Some("u2"));

        let report = fx
            .dispatcher
            .send_to_user("u1", Message::new("notice", Value::Null));
        assert_eq!(report.delivered, 2);
        assert_eq!(phone.kinds().len(), 1);
        assert_eq!(laptop.kinds().len(), 1);
        assert!(other.kinds().is_empty());
    }

    #[tokio::test]
    async fn broadcast_except_skips_sender() {
        let fx = fixture(10);
        let (sender, ts) = fx.connect(None);
        let (_, t1) = fx.connect(None);
        let (_, t2) = fx.connect(None);

        let report = fx
            .dispatcher
            .broadcast_except(Message::new("echo", Value::Null), &sender);
        assert_eq!(report.delivered, 2);
        assert!(ts.kinds().is_empty());
        assert_eq!(t1.kinds().len(), 1);
        assert_eq!(t2.kinds().len(), 1);
    }

    #[tokio::test]
    async fn terminated_connection_is_unknown() {
        let fx = fixture(10);
        let (id, _) = fx.connect(None);
        let _ = fx.registry.terminate(&id, 1000, "bye");
        assert_eq!(fx.dispatcher.send(&id, numbered(1)), Delivery::Unknown);
    }

    #[tokio::test]
    async fn closed_transport_queues_without_error() {
        let fx = fixture(10);
        let (id, transport) = fx.connect(None);
        transport.drop_peer();

        assert_eq!(fx.dispatcher.send(&id, numbered(1)), Delivery::Queued);
        assert_eq!(fx.registry.lookup(&id).unwrap().error_count, 0);
    }
}

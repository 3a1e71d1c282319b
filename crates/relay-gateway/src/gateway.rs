//! `Gateway`: the handle applications and the HTTP layer hold.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionControl, AdmissionPermit, Rejection};
use crate::config::GatewayConfig;
use crate::connection::{ConnectionId, ConnectionSnapshot, PeerInfo, Transport};
use crate::dispatcher::{BroadcastReport, Delivery, Dispatcher};
use crate::error::Result;
use crate::health::{HealthInputs, HealthResponse, health_check};
use crate::message::{Envelope, Message, close_code, types};
use crate::metrics::WS_ADMISSION_REJECTIONS_TOTAL;
use crate::registry::{ConnectionRegistry, Registration};
use crate::shutdown::ShutdownCoordinator;
use crate::stats::ConnectionStats;
use crate::sweep::run_health_sweep;

/// Capacity of the inbound application stream.
const INBOUND_CAPACITY: usize = 1024;

/// An application-defined message received from a peer.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Sending connection.
    pub connection_id: ConnectionId,
    /// User that opened the connection, if known.
    pub user_id: Option<String>,
    /// The parsed envelope.
    pub envelope: Envelope,
}

struct GatewayInner {
    config: Arc<GatewayConfig>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    admission: AdmissionControl,
    inbound: broadcast::Sender<InboundMessage>,
    shutdown: ShutdownCoordinator,
    started_at: Instant,
}

/// Cheaply cloneable gateway handle.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Build a gateway and start its health sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = ShutdownCoordinator::new(config.shutdown_grace);
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&config),
            shutdown.root_token(),
            shutdown.tracker(),
        ));

        if config.health_sweep_enabled {
            let _ = shutdown.tracker().spawn(run_health_sweep(
                Arc::clone(&registry),
                config.health_sweep_interval,
                shutdown.root_token(),
            ));
        }

        info!(
            max_connections = config.max_connections,
            ping_interval_ms = config.ping_interval.as_millis(),
            pong_timeout_ms = config.pong_timeout.as_millis(),
            queue_size = config.message_queue_size,
            heartbeat = config.heartbeat_enabled,
            sweep = config.health_sweep_enabled,
            hardened = config.hardened,
            "gateway started"
        );

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Ok(Self {
            inner: Arc::new(GatewayInner {
                dispatcher: Dispatcher::new(Arc::clone(&registry)),
                admission: AdmissionControl::new(Arc::clone(&config)),
                config,
                registry,
                inbound,
                shutdown,
                started_at: Instant::now(),
            }),
        })
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Evaluate a connection attempt ahead of the upgrade.
    pub fn admit(&self, origin: Option<&str>) -> std::result::Result<AdmissionPermit, Rejection> {
        self.inner.admission.evaluate(origin).inspect_err(|rejection| {
            counter!(WS_ADMISSION_REJECTIONS_TOTAL, "reason" => rejection.reason()).increment(1);
            warn!(reason = rejection.reason(), origin, "connection rejected");
        })
    }

    /// Register an admitted connection.
    pub fn register_connection(
        &self,
        permit: AdmissionPermit,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
    ) -> std::result::Result<Registration, Rejection> {
        self.inner.registry.register(permit, transport, peer)
    }

    /// Mark a connection open and flush its queue.
    pub fn mark_connected(&self, id: &ConnectionId) -> bool {
        self.inner.registry.mark_connected(id)
    }

    /// Send to one connection.
    pub fn send(&self, id: &ConnectionId, message: Message) -> Delivery {
        self.inner.dispatcher.send(id, message)
    }

    /// Drain one connection's queue.
    pub fn flush(&self, id: &ConnectionId) -> Option<usize> {
        self.inner.dispatcher.flush(id)
    }

    /// Send to every connection.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        self.inner.dispatcher.broadcast(message)
    }

    /// Send to the listed connections.
    pub fn broadcast_to_group(&self, ids: &[ConnectionId], message: Message) -> BroadcastReport {
        self.inner.dispatcher.broadcast_to_group(ids, message)
    }

    /// Send to every connection subscribed to `channel`.
    pub fn broadcast_to_channel(&self, channel: &str, message: Message) -> BroadcastReport {
        let ids = self.inner.registry.subscribers(channel);
        self.inner.dispatcher.broadcast_to_group(&ids, message)
    }

    /// Send to every connection of `user_id`.
    pub fn send_to_user(&self, user_id: &str, message: Message) -> BroadcastReport {
        self.inner.dispatcher.send_to_user(user_id, message)
    }

    /// Send to every connection except `exclude`.
    pub fn broadcast_except(&self, message: Message, exclude: &ConnectionId) -> BroadcastReport {
        self.inner.dispatcher.broadcast_except(message, exclude)
    }

    /// Terminate a connection.
    pub fn terminate(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        self.inner.registry.terminate(id, code, reason)
    }

    /// Snapshot of one connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        self.inner.registry.lookup(id)
    }

    /// Connections subscribed to `channel`.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner.registry.subscribers(channel)
    }

    /// Aggregate statistics.
    pub fn connection_stats(&self) -> ConnectionStats {
        self.inner.registry.stats()
    }

    /// Subscribe to application messages from peers.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.inbound.subscribe()
    }

    pub(crate) fn publish_inbound(&self, message: InboundMessage) {
        if let Err(broadcast::error::SendError(message)) = self.inner.inbound.send(message) {
            trace!(
                conn_id = %message.connection_id,
                kind = %message.envelope.kind,
                "no inbound subscribers"
            );
        }
    }

    /// `/health` body.
    pub fn health(&self) -> HealthResponse {
        let config = &self.inner.config;
        health_check(HealthInputs {
            start_time: self.inner.started_at,
            connections: self.inner.registry.len(),
            max_connections: config.max_connections,
            shutting_down: self.is_shutting_down(),
            compression_enabled: config.compression_enabled,
            heartbeat_enabled: config.heartbeat_enabled,
        })
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Resolve once shutdown has completed.
    pub async fn wait_for_shutdown(&self) {
        self.inner.shutdown.wait_complete().await;
    }

    /// Shut the gateway down. Only the first call has any effect.
    ///
    /// Refuses new admissions, sends a `shutdown` notice, closes every
    /// connection with 1001 behind whatever it still had queued, stops all
    /// timers, waits out the grace period for connection tasks and finally
    /// stops the listener.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutdown.begin() {
            debug!("shutdown already in progress");
            return;
        }
        info!(connections = inner.registry.len(), "shutdown started");

        inner.admission.close();
        let notice = inner.dispatcher.broadcast(Message::new(
            types::SHUTDOWN,
            json!({ "reason": "server shutting down" }),
        ));
        let closed = inner
            .registry
            .terminate_all(close_code::GOING_AWAY, "going away");
        inner.shutdown.cancel_timers();
        let clean = inner.shutdown.drain().await;
        inner.shutdown.close_listener();
        inner.shutdown.mark_complete();

        info!(
            notified = notice.reached(),
            closed,
            clean,
            "shutdown complete"
        );
    }

    /// Spawn a tracked task that shutdown waits for.
    pub(crate) fn spawn_task<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.shutdown.tracker().spawn(task)
    }

    /// Wrap a future so shutdown waits for it.
    pub(crate) fn track<F: Future>(&self, future: F) -> TrackedFuture<F> {
        self.inner.shutdown.tracker().track_future(future)
    }

    pub(crate) fn force_token(&self) -> CancellationToken {
        self.inner.shutdown.force_token()
    }

    pub(crate) fn listener_token(&self) -> CancellationToken {
        self.inner.shutdown.listener_token()
    }
}

//! Graceful shutdown coordination via `CancellationToken` and `TaskTracker`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// How long to wait for tasks after force-cancelling them.
const FORCE_WAIT: Duration = Duration::from_secs(1);

/// Coordinates shutdown across every gateway task.
///
/// Three tokens, cancelled in order: `root` stops heartbeat and sweep timers
/// (every per-connection token is a child), `force` aborts connection tasks
/// still running after the grace period, `listener` stops the HTTP server.
pub struct ShutdownCoordinator {
    started: AtomicBool,
    root: CancellationToken,
    force: CancellationToken,
    listener: CancellationToken,
    done: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            started: AtomicBool::new(false),
            root: CancellationToken::new(),
            force: CancellationToken::new(),
            listener: CancellationToken::new(),
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace,
        }
    }

    /// Claim the shutdown. Only the first caller gets `true`.
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Parent of every timer token.
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Cancelled when connection tasks must stop immediately.
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Cancelled when the listener should stop accepting.
    pub fn listener_token(&self) -> CancellationToken {
        self.listener.clone()
    }

    /// Tracker for connection, writer and timer tasks.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Stop every heartbeat and sweep timer.
    pub fn cancel_timers(&self) {
        self.root.cancel();
    }

    /// Wait up to the grace period for tracked tasks, then force the rest.
    ///
    /// Returns `true` if every task finished within the grace period.
    pub async fn drain(&self) -> bool {
        let _ = self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            grace_ms = self.grace.as_millis(),
            "waiting for connection tasks"
        );

        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_ok()
        {
            return true;
        }

        warn!(
            remaining = self.tracker.len(),
            "shutdown grace period elapsed, forcing remaining tasks"
        );
        self.force.cancel();
        if tokio::time::timeout(FORCE_WAIT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "tasks still running after force");
        }
        false
    }

    /// Stop the listener. Called last.
    pub fn close_listener(&self) {
        self.listener.cancel();
    }

    /// Mark shutdown finished and wake waiters.
    pub fn mark_complete(&self) {
        self.done.cancel();
    }

    /// Resolve once shutdown has completed.
    pub async fn wait_complete(&self) {
        self.done.cancelled().await;
    }

    /// Tracked tasks still running.
    pub fn tasks_remaining(&self) -> usize {
        self.tracker.len()
    }
}

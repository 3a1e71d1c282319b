//! Periodic health sweep.
//!
//! Independent of the heartbeat monitor: catches peers the monitor cannot
//! (heartbeat disabled, transport closed underneath the registry, error
//! storms). Staleness uses `pingInterval + pongTimeout * staleMultiplier`.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::close_code;
use crate::metrics::WS_SWEEP_TERMINATIONS_TOTAL;
use crate::registry::ConnectionRegistry;

/// Why the sweep terminated a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SweepReason {
    /// No pong within the staleness threshold.
    Stale,
    /// Error count above the limit.
    Errors,
    /// Transport no longer open.
    Orphaned,
}

impl SweepReason {
    /// Close code used for the termination.
    pub fn close_code(self) -> u16 {
        match self {
            Self::Stale | Self::Orphaned => close_code::ABNORMAL,
            Self::Errors => close_code::POLICY_VIOLATION,
        }
    }

    /// Close reason used for the termination.
    pub fn close_reason(self) -> &'static str {
        match self {
            Self::Stale => "stale connection",
            Self::Errors => "too many errors",
            Self::Orphaned => "transport closed",
        }
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Errors => "errors",
            Self::Orphaned => "orphaned",
        }
    }
}

/// Result of one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Connections examined.
    pub scanned: usize,
    /// Terminated as stale.
    pub stale: usize,
    /// Terminated for exceeding the error limit.
    pub erroring: usize,
    /// Terminated because the transport had closed.
    pub orphaned: usize,
}

impl SweepReport {
    /// Total terminations in this pass.
    pub fn terminated(&self) -> usize {
        self.stale + self.erroring + self.orphaned
    }
}

/// Run one pass over the registry.
pub fn sweep_once(registry: &ConnectionRegistry) -> SweepReport {
    let (scanned, flagged) = registry.sweep_candidates(Instant::now());
    let mut report = SweepReport {
        scanned,
        ..SweepReport::default()
    };

    for (id, reason) in flagged {
        // Another path may have terminated it since the scan.
        if !registry.terminate(&id, reason.close_code(), reason.close_reason()) {
            continue;
        }
        counter!(WS_SWEEP_TERMINATIONS_TOTAL, "reason" => reason.label()).increment(1);
        match reason {
            SweepReason::Stale => report.stale += 1,
            SweepReason::Errors => report.erroring += 1,
            SweepReason::Orphaned => report.orphaned += 1,
        }
    }

    if report.terminated() > 0 {
        info!(
            scanned = report.scanned,
            stale = report.stale,
            erroring = report.erroring,
            orphaned = report.orphaned,
            "health sweep terminated connections"
        );
    } else {
        debug!(scanned = report.scanned, "health sweep clean");
    }
    report
}

/// Sweep every `interval` until `cancel` fires.
pub async fn run_health_sweep(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("health sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                let _ = sweep_once(&registry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_logging::capture_logs;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::admission::AdmissionControl;
    use crate::config::GatewayConfig;
    use crate::connection::testing::RecordingTransport;
    use crate::connection::{ConnectionId, PeerInfo};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        admission: AdmissionControl,
    }

    fn fixture() -> Fixture {
        // Heartbeat left enabled for staleness, but monitors never run:
        // nothing is marked connected.
        let config = Arc::new(GatewayConfig {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
            stale_multiplier: 2,
            max_error_count: 3,
            ..GatewayConfig::default()
        });
        Fixture {
            registry: Arc::new(ConnectionRegistry::new(
                Arc::clone(&config),
                CancellationToken::new(),
                TaskTracker::new(),
            )),
            admission: AdmissionControl::new(config),
        }
    }

    impl Fixture {
        fn connect(&self) -> (ConnectionId, Arc<RecordingTransport>) {
            let transport = RecordingTransport::new();
            let reg = self
                .registry
                .register(
                    self.admission.evaluate(None).unwrap(),
                    transport.clone(),
                    PeerInfo::default(),
                )
                .unwrap();
            (reg.id, transport)
        }
    }

    #[test]
    fn reasons_map_to_close_codes() {
        assert_eq!(SweepReason::Stale.close_code(), 1006);
        assert_eq!(SweepReason::Orphaned.close_code(), 1006);
        assert_eq!(SweepReason::Errors.close_code(), 1008);
        assert_eq!(SweepReason::Errors.close_reason(), "too many errors");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_terminates_each_kind() {
        let fx = fixture();
        let (stale, stale_t) = fx.connect();
        let (fresh, _) = fx.connect();
        let (erroring, erroring_t) = fx.connect();
        let (orphan, orphan_t) = fx.connect();

        time::advance(Duration::from_secs(21)).await;
        for id in [&fresh, &erroring, &orphan] {
            let _ = fx.registry.record_pong(id);
        }
        for _ in 0..4 {
            let _ = fx.registry.record_error(&erroring);
        }
        orphan_t.drop_peer();

        let report = sweep_once(&fx.registry);
        assert_eq!(
            report,
            SweepReport {
                scanned: 4,
                stale: 1,
                erroring: 1,
                orphaned: 1,
            }
        );
        assert_eq!(report.terminated(), 3);
        assert_eq!(fx.registry.ids(), vec![fresh]);
        assert_eq!(stale_t.close_codes(), vec![1006]);
        assert_eq!(erroring_t.close_codes(), vec![1008]);
        assert_eq!(orphan_t.close_codes(), vec![1006]);
        assert!(!fx.registry.contains(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn error_count_at_limit_is_kept() {
        let fx = fixture();
        let (id, _) = fx.connect();
        for _ in 0..3 {
            let _ = fx.registry.record_error(&id);
        }
        assert_eq!(sweep_once(&fx.registry).terminated(), 0);
        assert!(fx.registry.contains(&id));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn one_log_line_per_pass() {
        let (logs, _guard) = capture_logs();
        let fx = fixture();
        let _a = fx.connect();
        let _b = fx.connect();
        time::advance(Duration::from_secs(30)).await;

        let report = sweep_once(&fx.registry);
        assert_eq!(report.stale, 2);
        let lines = logs.matching("health sweep");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].field("stale"), Some("2"));

        logs.clear();
        let _ = sweep_once(&fx.registry);
        assert_eq!(logs.matching("health sweep").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_runs_until_cancelled() {
        let fx = fixture();
        let (_id, transport) = fx.connect();
        transport.drop_peer();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_health_sweep(
            Arc::clone(&fx.registry),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fx.registry.len(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert!(fx.registry.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}

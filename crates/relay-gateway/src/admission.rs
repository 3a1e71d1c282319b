//! Admission control: capacity and origin policy ahead of the upgrade.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::GatewayConfig;

/// Why a connection attempt was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// `maxConnections` live connections already exist.
    #[error("server at capacity ({max} connections)")]
    CapacityExceeded {
        /// Configured limit.
        max: usize,
    },
    /// Hardened mode and the origin is not on the allow-list.
    #[error("origin not allowed: {origin}")]
    OriginNotAllowed {
        /// Declared origin.
        origin: String,
    },
    /// Shutdown has started.
    #[error("server shutting down")]
    ShuttingDown,
}

impl Rejection {
    /// Stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::OriginNotAllowed { .. } => "origin_not_allowed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// A reserved connection slot. The slot is freed when the permit drops.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
}

/// Gatekeeper for new connections.
///
/// Capacity is a counting semaphore with `maxConnections` permits. The
/// permit travels into the registry entry, so a slot is held exactly as
/// long as the connection is registered.
pub struct AdmissionControl {
    slots: Arc<Semaphore>,
    config: Arc<GatewayConfig>,
}

impl AdmissionControl {
    /// Create admission control for `config`.
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(
                config.max_connections.min(Semaphore::MAX_PERMITS),
            )),
            config,
        }
    }

    /// Evaluate a connection attempt. Nothing changes on rejection.
    pub fn evaluate(&self, origin: Option<&str>) -> Result<AdmissionPermit, Rejection> {
        if self.slots.is_closed() {
            return Err(Rejection::ShuttingDown);
        }
        if !self.config.origin_allowed(origin) {
            return Err(Rejection::OriginNotAllowed {
                origin: origin.unwrap_or_default().to_owned(),
            });
        }
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => Ok(AdmissionPermit { _slot: slot }),
            Err(TryAcquireError::NoPermits) => Err(Rejection::CapacityExceeded {
                max: self.config.max_connections,
            }),
            Err(TryAcquireError::Closed) => Err(Rejection::ShuttingDown),
        }
    }

    /// Refuse all further admissions.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Whether admissions are closed.
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(max: usize) -> AdmissionControl {
        AdmissionControl::new(Arc::new(GatewayConfig {
            max_connections: max,
            ..GatewayConfig::default()
        }))
    }

    #[test]
    fn admits_until_capacity() {
        let ac = control(2);
        let a = ac.evaluate(None).unwrap();
        let _b = ac.evaluate(None).unwrap();
        assert_eq!(
            ac.evaluate(None).unwrap_err(),
            Rejection::CapacityExceeded { max: 2 }
        );
        drop(a);
        assert!(ac.evaluate(None).is_ok());
    }

    #[test]
    fn rejection_has_no_side_effect() {
        let ac = control(1);
        let _held = ac.evaluate(None).unwrap();
        for _ in 0..5 {
            assert!(ac.evaluate(None).is_err());
        }
        assert_eq!(ac.available(), 0);
    }

    #[test]
    fn origin_rejected_in_hardened_mode() {
        let ac = AdmissionControl::new(Arc::new(GatewayConfig {
            hardened: true,
            allowed_origins: vec!["https://app.example".into()],
            ..GatewayConfig::default()
        }));
        let err = ac.evaluate(Some("https://evil.example")).unwrap_err();
        assert_eq!(err.reason(), "origin_not_allowed");
        assert_eq!(ac.available(), 10_000);
        assert!(ac.evaluate(Some("https://app.example")).is_ok());
        assert!(ac.evaluate(None).is_ok());
    }

    #[test]
    fn closed_rejects_shutting_down() {
        let ac = control(5);
        ac.close();
        assert!(ac.is_closed());
        assert_eq!(ac.evaluate(None).unwrap_err(), Rejection::ShuttingDown);
    }

    #[test]
    fn reasons_are_distinct() {
        let reasons = [
            Rejection::CapacityExceeded { max: 1 }.reason(),
            Rejection::OriginNotAllowed { origin: "x".into() }.reason(),
            Rejection::ShuttingDown.reason(),
        ];
        assert_eq!(reasons.len(), 3);
        assert_ne!(reasons[0], reasons[1]);
        assert_ne!(reasons[1], reasons[2]);
        assert_ne!(reasons[0], reasons[2]);
    }

    #[test]
    fn concurrent_admissions_respect_limit() {
        let ac = Arc::new(control(8));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ac = Arc::clone(&ac);
                std::thread::spawn(move || ac.evaluate(None).ok())
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 8);
    }

    #[test]
    fn oversized_capacity_is_clamped() {
        let ac = control(usize::MAX);
        assert_eq!(ac.available(), Semaphore::MAX_PERMITS);
        assert!(ac.evaluate(None).is_ok());
    }
}

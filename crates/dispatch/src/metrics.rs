use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-lifetime dispatch counters. Cheap to bump from any worker;
/// reset on restart.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    dispatched: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    auth_errors: AtomicU64,
    deferred: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    failovers: AtomicU64,
    validation_failures: AtomicU64,
    routing_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub sent: u64,
    pub failed: u64,
    pub auth_errors: u64,
    pub deferred: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub failovers: u64,
    pub validation_failures: u64,
    pub routing_failures: u64,
}

impl DispatchMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_auth_errors(&self) {
        self.auth_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_circuit_open(&self) {
        self.circuit_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_routing_failures(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            auth_errors: self.auth_errors.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
        }
    }
}

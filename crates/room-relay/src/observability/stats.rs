//! In-process relay counters.
//!
//! Mirrors the Prometheus metrics as plain atomics so embedding servers can
//! report them in health checks and tests can assert on them without
//! installing a recorder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters for one relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    envelopes_published: AtomicU64,
    publish_failures: AtomicU64,
    envelopes_replayed: AtomicU64,
    self_origin_discarded: AtomicU64,
    foreign_namespace_discarded: AtomicU64,
    malformed_discarded: AtomicU64,
    undeliverable_emits: AtomicU64,
    replay_failures: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Snapshot of relay counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub envelopes_published: u64,
    pub publish_failures: u64,
    pub envelopes_replayed: u64,
    pub self_origin_discarded: u64,
    pub foreign_namespace_discarded: u64,
    pub malformed_discarded: u64,
    pub undeliverable_emits: u64,
    pub replay_failures: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

impl RelayStats {
    /// Create a new shared stats instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_published(&self) {
        self.envelopes_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.envelopes_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_self_origin(&self) {
        self.self_origin_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_foreign_namespace(&self) {
        self.foreign_namespace_discarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undeliverable(&self) {
        self.undeliverable_emits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_failure(&self) {
        self.replay_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deliveries(&self, count: usize) {
        self.deliveries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            envelopes_published: self.envelopes_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            envelopes_replayed: self.envelopes_replayed.load(Ordering::Relaxed),
            self_origin_discarded: self.self_origin_discarded.load(Ordering::Relaxed),
            foreign_namespace_discarded: self.foreign_namespace_discarded.load(Ordering::Relaxed),
            malformed_discarded: self.malformed_discarded.load(Ordering::Relaxed),
            undeliverable_emits: self.undeliverable_emits.load(Ordering::Relaxed),
            replay_failures: self.replay_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

//! Delivery statistics for a subscription.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated lock-free from every delivery path.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    expired: AtomicU64,
    dead_lettered: AtomicU64,
    retention_dropped: AtomicU64,
    invalid_acks: AtomicU64,
    stale_acks: AtomicU64,
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lease grant. Deliveries after the first also count as redeliveries.
    pub(crate) fn record_delivery(&self, delivery_count: u32) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if delivery_count > 1 {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_ack(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_nack(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retention_drop(&self) {
        self.retention_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_ack(&self) {
        self.invalid_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_ack(&self) {
        self.stale_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retention_dropped: self.retention_dropped.load(Ordering::Relaxed),
            invalid_acks: self.invalid_acks.load(Ordering::Relaxed),
            stale_acks: self.stale_acks.load(Ordering::Relaxed),
            outstanding: 0,
        }
    }
}

/// Point-in-time copy of [`SubscriptionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
    pub dead_lettered: u64,
    pub retention_dropped: u64,
    pub invalid_acks: u64,
    pub stale_acks: u64,
    /// Leases currently held by consumers.
    pub outstanding: u64,
}

impl StatsSnapshot {
    /// Fraction of deliveries that were redeliveries (0.0 to 1.0).
    pub fn redelivery_ratio(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.redelivered as f64 / self.delivered as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Delivered: {}, Redelivered: {}, Acked: {}, Nacked: {}, Expired: {}, Dead-lettered: {}, Outstanding: {}",
            self.delivered,
            self.redelivered,
            self.acked,
            self.nacked,
            self.expired,
            self.dead_lettered,
            self.outstanding
        )
    }
}

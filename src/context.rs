//! Per-subscription state container.
//!
//! Every component (lease table, scheduler, ack processor, sessions) reaches
//! subscription state through one [`SubscriptionContext`], passed by
//! reference. Nothing is shared between subscriptions, so contexts can be
//! sharded freely.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::clock::{duration_ns, Clock};
use crate::config::{BrokerConfig, RedeliveryPolicy};
use crate::lease::LeaseTable;
use crate::message::ReceivedMessage;
use crate::message_log::MessageLog;
use crate::scheduler::{self, BatchLimits, NextBatch};
use crate::session::{close_session, CloseReason, SessionRegistry, SessionShared};
use crate::stats::{StatsSnapshot, SubscriptionStats};
use crate::subscription::Subscription;
use crate::{Error, Result};

pub struct SubscriptionContext {
    name: String,
    subscription: RwLock<Subscription>,
    leases: LeaseTable,
    sessions: SessionRegistry,
    log: Arc<dyn MessageLog>,
    clock: Arc<dyn Clock>,
    config: Arc<BrokerConfig>,
    stats: Arc<SubscriptionStats>,
    /// Last offset reported to the log via `advance`.
    cursor: AtomicU64,
    wakeup: Notify,
    deleted: AtomicBool,
}

impl SubscriptionContext {
    pub(crate) fn new(
        subscription: Subscription,
        incarnation: u32,
        start_offset: u64,
        log: Arc<dyn MessageLog>,
        clock: Arc<dyn Clock>,
        config: Arc<BrokerConfig>,
    ) -> Self {
        let stats = Arc::new(SubscriptionStats::new());
        let leases = LeaseTable::new(
            config.lease_shards,
            incarnation,
            start_offset,
            subscription.exactly_once_enabled,
            Arc::clone(&stats),
        );
        Self {
            name: subscription.name.clone(),
            subscription: RwLock::new(subscription),
            leases,
            sessions: SessionRegistry::new(),
            log,
            clock,
            config,
            stats,
            cursor: AtomicU64::new(start_offset),
            wakeup: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn topic(&self) -> String {
        self.subscription().topic
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// The subscription's own policy, else the broker default.
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        self.subscription()
            .redelivery_policy
            .unwrap_or_else(|| self.config.redelivery.clone())
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.outstanding = self.leases.outstanding() as u64;
        snapshot
    }

    /// Wakes every task waiting for deliverable messages.
    pub fn wake(&self) {
        self.wakeup.notify_waiters();
    }

    /// Future resolved by the next [`SubscriptionContext::wake`]. Call
    /// `enable` on it before checking for work to avoid missing a wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::SubscriptionDeleted(self.name.clone()));
        }
        Ok(())
    }

    pub fn next_batch<'a>(
        &'a self,
        owner: Option<&'a Arc<SessionShared>>,
        limits: BatchLimits,
    ) -> NextBatch<'a> {
        scheduler::next_batch(self, owner, limits)
    }

    /// One non-blocking pull of up to `max_messages`.
    pub fn pull_once(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.ensure_live()?;
        Ok(self
            .next_batch(None, BatchLimits::messages(max_messages))
            .collect())
    }

    pub(crate) fn update(&self, next: Subscription) {
        self.leases
            .fencing()
            .set_enabled(next.exactly_once_enabled);
        *self
            .subscription
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        self.wake();
    }

    /// Returns overdue leases to PENDING. Returns how many expired.
    pub fn expire_sweep(&self) -> usize {
        let expired = self
            .leases
            .expire_sweep(self.now(), &self.redelivery_policy());
        if expired > 0 {
            debug!("subscription {}: {} leases expired", self.name, expired);
            self.wake();
        }
        expired
    }

    /// Advances the ack floor and tells the log which prefix it may drop.
    /// Acked messages stay pinned for `message_retention` when retained.
    pub fn compact(&self) -> Result<u64> {
        let floor = self.leases.compact();
        let sub = self.subscription();
        let target = if sub.retain_acked_messages {
            let horizon = self
                .now()
                .saturating_sub(duration_ns(sub.message_retention));
            floor.min(self.log.offset_for_time(&sub.topic, horizon)?)
        } else {
            floor
        };
        if target > self.cursor.load(Ordering::Acquire) {
            self.log.advance(&self.name, &sub.topic, target)?;
            self.cursor.store(target, Ordering::Release);
        }
        Ok(floor)
    }

    /// Floor and settled offsets above it, as captured by a snapshot.
    pub(crate) fn snapshot_state(&self) -> (u64, BTreeSet<u64>) {
        let floor = self.leases.compact();
        (floor, self.leases.settled_above_floor())
    }

    /// Repositions the subscription. Returns the number of leases invalidated.
    pub(crate) fn seek(&self, floor: u64, acked: &BTreeSet<u64>) -> usize {
        let invalidated = self.leases.reset(floor, acked, self.now());
        self.leases.compact();
        info!(
            "subscription {}: seek to offset {} ({} acked above), {} leases invalidated",
            self.name,
            floor,
            acked.len(),
            invalidated
        );
        self.wake();
        invalidated
    }

    /// Invalidates every lease and closes every session.
    pub(crate) fn mark_deleted(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in self.sessions.all() {
            close_session(self, &session, CloseReason::SubscriptionDeleted);
        }
        let cleared = self.leases.clear();
        self.log.detach(&self.name, &self.topic());
        info!(
            "subscription {} deleted, {} leases invalidated",
            self.name, cleared
        );
        self.wake();
    }

    /// Closes every session, releasing their leases.
    pub(crate) fn close_sessions(&self, reason: CloseReason) -> usize {
        self.sessions
            .all()
            .iter()
            .filter(|session| close_session(self, session, reason))
            .count()
    }
}

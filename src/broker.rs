//! Broker: topic and subscription administration plus the client-facing
//! Pull, StreamingPull, Acknowledge, ModifyAckDeadline and Seek calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ack::{self, AckConfirmation};
use crate::ack_id::AckId;
use crate::clock::{duration_ns, Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::context::SubscriptionContext;
use crate::lease::AckOutcome;
use crate::message::{PublishRequest, ReceivedMessage};
use crate::message_log::{InMemoryLog, MessageLog};
use crate::session::CloseReason;
use crate::snapshot::{SeekTarget, Snapshot, SnapshotStore};
use crate::stats::StatsSnapshot;
use crate::streaming::{self, StreamingPull, StreamingPullRequest};
use crate::subscription::{Subscription, SubscriptionUpdate};
use crate::{Error, Result};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_leases: usize,
    pub compacted_messages: u64,
    pub expired_snapshots: usize,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    log: Arc<dyn MessageLog>,
    clock: Arc<dyn Clock>,
    subscriptions: RwLock<HashMap<String, Arc<SubscriptionContext>>>,
    snapshots: SnapshotStore,
    next_incarnation: AtomicU32,
}

impl Broker {
    /// In-memory log and wall clock.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(InMemoryLog::new()), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: BrokerConfig,
        log: Arc<dyn MessageLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            log,
            clock,
            subscriptions: RwLock::new(HashMap::new()),
            snapshots: SnapshotStore::new(),
            next_incarnation: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // Topics

    pub fn create_topic(&self, topic: &str) -> Result<()> {
        self.log.create_topic(topic)?;
        info!("topic {topic} created");
        Ok(())
    }

    /// Appends a message and wakes consumers of the topic. Returns its id.
    pub fn publish(&self, topic: &str, request: PublishRequest) -> Result<String> {
        let message = self.log.append(topic, request, self.now())?;
        self.wake_topic(topic);
        Ok(message.id.clone())
    }

    pub fn publish_batch(&self, topic: &str, requests: Vec<PublishRequest>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.log.append(topic, request, self.now())?.id.clone());
        }
        self.wake_topic(topic);
        Ok(ids)
    }

    fn wake_topic(&self, topic: &str) {
        for ctx in self.read_subscriptions().values() {
            if ctx.topic() == topic {
                ctx.wake();
            }
        }
    }

    // Subscriptions

    /// Creates a subscription that receives messages published from now on.
    pub fn create_subscription(&self, subscription: Subscription) -> Result<()> {
        subscription.validate()?;
        if !self.log.topic_exists(&subscription.topic) {
            return Err(Error::TopicNotFound(subscription.topic));
        }
        if let Some(policy) = &subscription.dead_letter_policy {
            if !self.log.topic_exists(&policy.dead_letter_topic) {
                return Err(Error::TopicNotFound(policy.dead_letter_topic.clone()));
            }
        }
        let mut subscriptions = self.write_subscriptions();
        if subscriptions.contains_key(&subscription.name) {
            return Err(Error::SubscriptionExists(subscription.name));
        }
        let start = self.log.end_offset(&subscription.topic)?;
        self.log
            .advance(&subscription.name, &subscription.topic, start)?;
        let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
        info!(
            "subscription {} created on {} at offset {}",
            subscription.name, subscription.topic, start
        );
        let name = subscription.name.clone();
        let ctx = SubscriptionContext::new(
            subscription,
            incarnation,
            start,
            Arc::clone(&self.log),
            Arc::clone(&self.clock),
            Arc::clone(&self.config),
        );
        subscriptions.insert(name, Arc::new(ctx));
        Ok(())
    }

    pub fn get_subscription(&self, name: &str) -> Result<Subscription> {
        Ok(self.context(name)?.subscription())
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<_> = self
            .read_subscriptions()
            .values()
            .map(|ctx| ctx.subscription())
            .collect();
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));
        subscriptions
    }

    pub fn update_subscription(&self, update: SubscriptionUpdate) -> Result<Subscription> {
        let ctx = self.context(&update.subscription.name)?;
        let next = update.apply(&ctx.subscription())?;
        if let Some(policy) = &next.dead_letter_policy {
            if !self.log.topic_exists(&policy.dead_letter_topic) {
                return Err(Error::TopicNotFound(policy.dead_letter_topic.clone()));
            }
        }
        ctx.update(next.clone());
        info!("subscription {} updated: {:?}", next.name, update.mask);
        Ok(next)
    }

    /// Removes the subscription, invalidating its leases and closing its streams.
    pub fn delete_subscription(&self, name: &str) -> Result<()> {
        let ctx = self
            .write_subscriptions()
            .remove(name)
            .ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))?;
        ctx.mark_deleted();
        Ok(())
    }

    /// Context of a live subscription.
    pub fn context(&self, name: &str) -> Result<Arc<SubscriptionContext>> {
        self.read_subscriptions()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))
    }

    // Pull

    /// Non-blocking pull: whatever is deliverable right now.
    pub fn try_pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.validate_max_messages(max_messages)?;
        self.context(subscription)?.pull_once(max_messages)
    }

    /// One-shot pull. Unless `return_immediately`, waits up to `pull_wait_ms`
    /// for at least one message.
    pub async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
        return_immediately: bool,
    ) -> Result<Vec<ReceivedMessage>> {
        self.validate_max_messages(max_messages)?;
        let ctx = self.context(subscription)?;
        if return_immediately {
            return ctx.pull_once(max_messages);
        }
        let deadline = tokio::time::Instant::now() + self.config.pull_wait();
        let poll = self.config.session.poll_interval();
        loop {
            let notified = ctx.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = ctx.pull_once(max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let wait = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .min(poll);
            if wait.is_zero() {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn validate_max_messages(&self, max_messages: usize) -> Result<()> {
        if max_messages == 0 || max_messages > self.config.max_pull_messages {
            return Err(Error::InvalidArgument(format!(
                "max_messages {max_messages} outside [1, {}]",
                self.config.max_pull_messages
            )));
        }
        Ok(())
    }

    /// Opens a streaming pull. Must be called inside a tokio runtime.
    pub fn streaming_pull(&self, request: StreamingPullRequest) -> Result<StreamingPull> {
        let ctx = self.context(&request.subscription)?;
        streaming::open(ctx, request)
    }

    // Acknowledgement

    /// Acknowledges every id, then reports the first failure, if any.
    pub fn acknowledge(&self, subscription: &str, ack_ids: &[AckId]) -> Result<()> {
        let ctx = self.context(subscription)?;
        let mut first_err = None;
        for ack_id in ack_ids {
            if let Err(e) = ack::acknowledge(&ctx, ack_id) {
                if e.closes_session() {
                    return Err(e);
                }
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn acknowledge_one(&self, subscription: &str, ack_id: &AckId) -> Result<AckOutcome> {
        let ctx = self.context(subscription)?;
        ack::acknowledge(&ctx, ack_id)
    }

    pub fn acknowledge_with_confirmation(
        &self,
        subscription: &str,
        ack_ids: &[AckId],
    ) -> Result<AckConfirmation> {
        let ctx = self.context(subscription)?;
        ack::acknowledge_batch(&ctx, ack_ids)
    }

    /// `seconds == 0` nacks; otherwise extends. Reports the first failure.
    pub fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[AckId],
        seconds: i64,
    ) -> Result<()> {
        let ctx = self.context(subscription)?;
        let mut first_err = None;
        for ack_id in ack_ids {
            if let Err(e) = ack::modify_ack_deadline(&ctx, ack_id, seconds) {
                if matches!(e, Error::InvalidArgument(_)) || e.closes_session() {
                    return Err(e);
                }
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn modify_ack_deadline_with_confirmation(
        &self,
        subscription: &str,
        ack_ids: &[AckId],
        seconds: i64,
    ) -> Result<AckConfirmation> {
        let ctx = self.context(subscription)?;
        ack::modify_ack_deadline_batch(&ctx, ack_ids, seconds)
    }

    // Seek and snapshots

    /// Repositions the subscription. Returns the number of leases invalidated.
    pub fn seek(&self, subscription: &str, target: SeekTarget) -> Result<usize> {
        let ctx = self.context(subscription)?;
        ctx.ensure_live()?;
        let topic = ctx.topic();
        let (floor, acked) = match target {
            SeekTarget::Time(publish_time_ns) => (
                self.log.offset_for_time(&topic, publish_time_ns)?,
                Default::default(),
            ),
            SeekTarget::Snapshot(name) => {
                let snapshot = self.snapshots.get(&name, self.now())?;
                if snapshot.topic != topic {
                    return Err(Error::InvalidArgument(format!(
                        "snapshot {name} is on topic {}, subscription {subscription} on {topic}",
                        snapshot.topic
                    )));
                }
                (snapshot.floor, snapshot.acked)
            }
        };
        Ok(ctx.seek(floor, &acked))
    }

    /// Captures the subscription's acknowledgement state under `name`.
    pub fn create_snapshot(&self, name: &str, subscription: &str) -> Result<Snapshot> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name cannot be empty".into()));
        }
        let ctx = self.context(subscription)?;
        ctx.ensure_live()?;
        let sub = ctx.subscription();
        let (floor, acked) = ctx.snapshot_state();
        let now = self.now();
        let snapshot = Snapshot {
            name: name.to_string(),
            topic: sub.topic,
            floor,
            acked,
            created_at_ns: now,
            expire_at_ns: now.saturating_add(duration_ns(sub.message_retention)),
        };
        self.snapshots.insert(snapshot.clone())?;
        info!(
            "snapshot {name} of {subscription} created at floor {}",
            snapshot.floor
        );
        Ok(snapshot)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.snapshots.remove(name)?;
        info!("snapshot {name} deleted");
        Ok(())
    }

    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.list(self.now())
    }

    // Maintenance

    /// One pass of lease expiry, ack-floor compaction, log compaction and
    /// snapshot expiry.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let contexts: Vec<_> = self.read_subscriptions().values().cloned().collect();
        for ctx in contexts {
            report.expired_leases += ctx.expire_sweep();
            if let Err(e) = ctx.compact() {
                warn!("subscription {}: compaction failed: {e}", ctx.name());
            }
        }
        report.compacted_messages = self
            .log
            .compact(self.now())
            .iter()
            .map(|(_, removed)| removed)
            .sum();
        report.expired_snapshots = self.snapshots.expire(self.now());
        report
    }

    /// Runs [`Broker::run_maintenance`] every `sweep_interval_ms` until the
    /// broker is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let broker: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                broker.run_maintenance();
            }
        })
    }

    /// Closes every streaming session. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let contexts: Vec<_> = self.read_subscriptions().values().cloned().collect();
        let closed = contexts
            .iter()
            .map(|ctx| ctx.close_sessions(CloseReason::BrokerShutdown))
            .sum();
        info!("broker shut down, {closed} sessions closed");
        closed
    }

    pub fn stats(&self, subscription: &str) -> Result<StatsSnapshot> {
        Ok(self.context(subscription)?.stats_snapshot())
    }

    fn read_subscriptions(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SubscriptionContext>>> {
        self.subscriptions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_subscriptions(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<String, Arc<SubscriptionContext>>> {
        self.subscriptions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

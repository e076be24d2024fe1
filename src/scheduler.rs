//! Delivery scheduler: picks the next messages for a consumer.
//!
//! A batch is planned by scanning the log forward from the ack floor. Each
//! message is classified against the lease table. Only messages that could
//! be delivered now count towards `scan_window`. Eligible ones are grouped
//! into one lane per ordering key (messages without a key share a lane), and
//! lanes are drained round-robin, oldest head first, so one busy key cannot
//! starve the rest.
//! With ordering enabled a key holding an outstanding lease (or a message in
//! redelivery backoff) is blocked, and at most one message per key is chosen
//! per batch, so deliveries for a key never overtake each other.
//!
//! The batch is lazy: leases are only taken as the caller pulls items, and a
//! lease lost to a concurrent scheduler is skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};

use crate::ack::{delivery_decision, DeliveryDecision};
use crate::clock::duration_ns;
use crate::context::SubscriptionContext;
use crate::dead_letter;
use crate::lease::LeaseState;
use crate::message::{Message, ReceivedMessage};
use crate::session::SessionShared;
use crate::Error;

/// Candidates gathered per requested message before the scan stops early.
const CANDIDATE_FACTOR: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_messages: usize,
    pub max_bytes: u64,
}

impl BatchLimits {
    pub fn new(max_messages: usize, max_bytes: u64) -> Self {
        Self {
            max_messages,
            max_bytes,
        }
    }

    pub fn messages(max_messages: usize) -> Self {
        Self::new(max_messages, u64::MAX)
    }
}

/// Lazily leases up to `limits` messages for `owner` (or for a one-shot pull
/// when `owner` is `None`). Limits are clamped to the owner's credit.
pub fn next_batch<'a>(
    ctx: &'a SubscriptionContext,
    owner: Option<&'a Arc<SessionShared>>,
    limits: BatchLimits,
) -> NextBatch<'a> {
    let limits = match owner {
        Some(session) => {
            let (messages, bytes) = session.available_credit();
            BatchLimits::new(
                limits
                    .max_messages
                    .min(usize::try_from(messages).unwrap_or(usize::MAX)),
                limits.max_bytes.min(bytes),
            )
        }
        None => limits,
    };
    NextBatch {
        ctx,
        owner,
        limits,
        plan: None,
        delivered: 0,
        bytes: 0,
    }
}

/// Lanes of eligible messages, drained round-robin.
struct Plan {
    lanes: Vec<VecDeque<Arc<Message>>>,
    cursor: usize,
    now_ns: u64,
    deadline_ns: u64,
}

impl Plan {
    fn empty(now_ns: u64) -> Self {
        Self {
            lanes: Vec::new(),
            cursor: 0,
            now_ns,
            deadline_ns: now_ns,
        }
    }

    fn next_candidate(&mut self) -> Option<Arc<Message>> {
        for _ in 0..self.lanes.len() {
            let idx = self.cursor % self.lanes.len();
            self.cursor = idx + 1;
            if let Some(message) = self.lanes[idx].pop_front() {
                return Some(message);
            }
        }
        None
    }
}

pub struct NextBatch<'a> {
    ctx: &'a SubscriptionContext,
    owner: Option<&'a Arc<SessionShared>>,
    limits: BatchLimits,
    plan: Option<Plan>,
    delivered: usize,
    bytes: u64,
}

impl<'a> NextBatch<'a> {
    fn build_plan(&self) -> Plan {
        let ctx = self.ctx;
        let now_ns = ctx.now();
        if self.limits.max_messages == 0 || self.limits.max_bytes == 0 || ctx.is_deleted() {
            return Plan::empty(now_ns);
        }
        let subscription = ctx.subscription();
        let ack_deadline = match self.owner {
            Some(session) => session.stream_ack_deadline(),
            None => subscription.ack_deadline,
        };
        let policy = ctx.redelivery_policy();
        let leases = ctx.leases();

        let reader = match ctx.log().read_from(&subscription.topic, leases.floor()) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("subscription {}: cannot read log: {e}", subscription.name);
                return Plan::empty(now_ns);
            }
        };

        let retention_ns = duration_ns(subscription.message_retention);
        let wanted = self.limits.max_messages.saturating_mul(CANDIDATE_FACTOR);

        let mut lanes: Vec<VecDeque<Arc<Message>>> = Vec::new();
        let mut lane_of: HashMap<Option<String>, usize> = HashMap::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let scan_window = ctx.config().scan_window;
        let mut candidates = 0;
        let mut inspected = 0;

        // Settled messages, live leases and blocked keys are passed over
        // without using up the window.
        for message in reader {
            if candidates >= wanted || inspected >= scan_window {
                break;
            }
            let lane_key = message.ordering_key.clone();
            let key = if subscription.ordering_enabled {
                lane_key.clone()
            } else {
                None
            };
            if key.as_ref().is_some_and(|k| blocked.contains(k)) {
                continue;
            }

            let view = leases.view_at(message.offset, now_ns, &policy);
            let delivery_count = match &view {
                Some(view) if view.state.is_settled() => continue,
                Some(view) if view.state == LeaseState::Leased && view.is_live(now_ns) => {
                    block(&mut blocked, &key);
                    continue;
                }
                Some(view) if view.state == LeaseState::Pending && view.available_at_ns > now_ns => {
                    block(&mut blocked, &key);
                    continue;
                }
                Some(view) => view.delivery_count,
                None => 0,
            };
            inspected += 1;

            if message.publish_time_ns.saturating_add(retention_ns) < now_ns {
                if leases.drop_expired_message(message.offset, now_ns) {
                    ctx.stats().record_retention_drop();
                    debug!(
                        "subscription {}: message {} outlived retention",
                        subscription.name, message.id
                    );
                }
                continue;
            }

            if let DeliveryDecision::DeadLetter { topic, attempts } =
                delivery_decision(delivery_count, subscription.dead_letter_policy.as_ref())
            {
                if dead_letter::forward(ctx, &message, &topic, attempts).is_err() {
                    block(&mut blocked, &key);
                }
                continue;
            }

            let idx = *lane_of.entry(lane_key).or_insert_with(|| {
                lanes.push(VecDeque::new());
                lanes.len() - 1
            });
            let per_lane = if key.is_some() {
                1
            } else {
                self.limits.max_messages
            };
            if lanes[idx].len() < per_lane {
                lanes[idx].push_back(message);
                candidates += 1;
            }
            block(&mut blocked, &key);
        }

        Plan {
            lanes,
            cursor: 0,
            now_ns,
            deadline_ns: now_ns.saturating_add(duration_ns(ack_deadline)),
        }
    }

    fn deliver(&self, message: Arc<Message>, plan: &Plan) -> Option<ReceivedMessage> {
        match self
            .ctx
            .leases()
            .lease(&message, plan.deadline_ns, plan.now_ns, self.owner)
        {
            Ok(grant) => Some(ReceivedMessage {
                ack_id: grant.ack_id,
                message,
                delivery_attempt: grant.delivery_count,
                fencing_token: grant.fencing_token,
            }),
            Err(Error::AlreadyLeased) => {
                debug!(
                    "subscription {}: offset {} leased concurrently, skipping",
                    self.ctx.name(),
                    message.offset
                );
                None
            }
            Err(e) => {
                debug!("subscription {}: lease failed: {e}", self.ctx.name());
                None
            }
        }
    }
}

fn block(blocked: &mut HashSet<String>, key: &Option<String>) {
    if let Some(key) = key {
        blocked.insert(key.clone());
    }
}

impl Iterator for NextBatch<'_> {
    type Item = ReceivedMessage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.plan.is_none() {
            self.plan = Some(self.build_plan());
        }
        loop {
            if self.delivered >= self.limits.max_messages {
                return None;
            }
            if self.owner.is_some_and(|session| !session.is_alive()) {
                return None;
            }
            let plan = self.plan.as_mut()?;
            let message = plan.next_candidate()?;
            let size = message.size_bytes();
            // A single oversized message is still delivered on its own.
            if self.delivered > 0 && self.bytes.saturating_add(size) > self.limits.max_bytes {
                return None;
            }
            let plan = self.plan.as_ref()?;
            if let Some(received) = self.deliver(message, plan) {
                self.delivered += 1;
                self.bytes = self.bytes.saturating_add(size);
                return Some(received);
            }
        }
    }
}

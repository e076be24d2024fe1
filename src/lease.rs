//! Per-subscription lease table.
//!
//! Tracks, for every message that has been offered at least once, whether it
//! is waiting for (re)delivery, checked out to a consumer, or settled. Entries
//! are striped across `lease_shards` mutexes keyed by log offset, so every
//! transition on one message is serialized while unrelated messages proceed
//! in parallel. There is no table-wide lock on the ack/lease paths.
//!
//! The "ack floor" is the lowest offset not yet settled. Settled entries below
//! it are dropped from the table; an ack id naming an offset under the floor
//! is treated as already acknowledged.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ack_id::{AckId, AckToken};
use crate::clock::duration_ns;
use crate::config::RedeliveryPolicy;
use crate::fencing::FencingTracker;
use crate::message::Message;
use crate::session::{SessionId, SessionShared};
use crate::stats::SubscriptionStats;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// Waiting for (re)delivery once `available_at_ns` has passed.
    Pending,
    /// Checked out to a consumer until `deadline_ns`.
    Leased,
    Acked,
    /// Forwarded to the dead-letter topic; settled for this subscription.
    DeadLettered,
}

impl LeaseState {
    pub fn is_settled(self) -> bool {
        matches!(self, LeaseState::Acked | LeaseState::DeadLettered)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// The delivery was already acknowledged; nothing changed.
    AlreadyAcked,
}

struct LeaseEntry {
    state: LeaseState,
    delivery_count: u32,
    serial: u64,
    fencing_token: u64,
    deadline_ns: u64,
    available_at_ns: u64,
    bytes: u64,
    owner: Option<Arc<SessionShared>>,
}

impl LeaseEntry {
    fn fresh(bytes: u64) -> Self {
        Self {
            state: LeaseState::Pending,
            delivery_count: 0,
            serial: 0,
            fencing_token: 0,
            deadline_ns: 0,
            available_at_ns: 0,
            bytes,
            owner: None,
        }
    }

    fn tombstone() -> Self {
        Self {
            state: LeaseState::Acked,
            ..Self::fresh(0)
        }
    }

    fn disown(&mut self, offset: u64) {
        if let Some(owner) = self.owner.take() {
            owner.settle(offset, self.serial);
        }
    }

    /// LEASED -> PENDING, applying the redelivery backoff.
    fn requeue(&mut self, offset: u64, now_ns: u64, policy: &RedeliveryPolicy) {
        self.disown(offset);
        self.state = LeaseState::Pending;
        self.available_at_ns = now_ns.saturating_add(duration_ns(policy.backoff(self.delivery_count)));
    }
}

/// Read-only copy of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseView {
    pub state: LeaseState,
    pub delivery_count: u32,
    pub fencing_token: u64,
    pub deadline_ns: u64,
    pub available_at_ns: u64,
    pub owner: Option<SessionId>,
    pub owner_alive: bool,
}

impl LeaseView {
    /// Leased, unexpired, and held by a live owner (pulls have no owner).
    pub fn is_live(&self, now_ns: u64) -> bool {
        self.state == LeaseState::Leased && self.deadline_ns >= now_ns && self.owner_alive
    }
}

#[derive(Clone, Debug)]
pub struct LeaseGrant {
    pub ack_id: AckId,
    pub delivery_count: u32,
    /// Present only when exactly-once delivery is enabled.
    pub fencing_token: Option<u64>,
    pub deadline_ns: u64,
}

enum Resolved<'a> {
    Current(&'a mut LeaseEntry),
    Settled,
}

type Shard = HashMap<u64, LeaseEntry>;

pub struct LeaseTable {
    shards: Box<[Mutex<Shard>]>,
    incarnation: u32,
    next_serial: AtomicU64,
    floor: AtomicU64,
    compaction: Mutex<()>,
    fencing: FencingTracker,
    stats: Arc<SubscriptionStats>,
}

impl LeaseTable {
    pub fn new(
        shards: usize,
        incarnation: u32,
        floor: u64,
        exactly_once: bool,
        stats: Arc<SubscriptionStats>,
    ) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            incarnation,
            next_serial: AtomicU64::new(1),
            floor: AtomicU64::new(floor),
            compaction: Mutex::new(()),
            fencing: FencingTracker::new(exactly_once),
            stats,
        }
    }

    fn shard(&self, offset: u64) -> MutexGuard<'_, Shard> {
        let idx = (offset % self.shards.len() as u64) as usize;
        lock(&self.shards[idx])
    }

    pub fn fencing(&self) -> &FencingTracker {
        &self.fencing
    }

    /// Lowest offset not yet settled.
    pub fn floor(&self) -> u64 {
        self.floor.load(Ordering::Acquire)
    }

    pub fn view(&self, offset: u64) -> Option<LeaseView> {
        self.shard(offset).get(&offset).map(view_of)
    }

    /// Like [`LeaseTable::view`], but first expires a lease whose deadline passed.
    pub fn view_at(&self, offset: u64, now_ns: u64, policy: &RedeliveryPolicy) -> Option<LeaseView> {
        let mut shard = self.shard(offset);
        let entry = shard.get_mut(&offset)?;
        if entry.state == LeaseState::Leased && entry.deadline_ns < now_ns {
            entry.requeue(offset, now_ns, policy);
            self.stats.record_expired(1);
        }
        Some(view_of(entry))
    }

    /// Checks `message` out until `deadline_ns`.
    ///
    /// Fails with [`Error::AlreadyLeased`] when the message is held by a live,
    /// unexpired lease, is still backing off, or is already settled. A lease
    /// that expired or whose owner disconnected is handed over.
    pub fn lease(
        &self,
        message: &Message,
        deadline_ns: u64,
        now_ns: u64,
        owner: Option<&Arc<SessionShared>>,
    ) -> Result<LeaseGrant> {
        let offset = message.offset;
        if offset < self.floor() {
            return Err(Error::AlreadyLeased);
        }
        if let Some(owner) = owner {
            if !owner.is_alive() {
                return Err(Error::SessionClosed(owner.id()));
            }
        }
        let mut shard = self.shard(offset);
        // Compaction moves the floor while holding this shard.
        if offset < self.floor() {
            return Err(Error::AlreadyLeased);
        }
        let entry = shard
            .entry(offset)
            .or_insert_with(|| LeaseEntry::fresh(message.size_bytes()));
        match entry.state {
            LeaseState::Acked | LeaseState::DeadLettered => return Err(Error::AlreadyLeased),
            LeaseState::Pending => {
                if entry.available_at_ns > now_ns {
                    return Err(Error::AlreadyLeased);
                }
            }
            LeaseState::Leased => {
                let owner_alive = entry.owner.as_ref().map_or(true, |o| o.is_alive());
                if entry.deadline_ns >= now_ns && owner_alive {
                    return Err(Error::AlreadyLeased);
                }
                if entry.deadline_ns < now_ns {
                    self.stats.record_expired(1);
                }
                entry.disown(offset);
            }
        }

        let serial = self.next_serial.fetch_add(1, Ordering::AcqRel);
        entry.state = LeaseState::Leased;
        entry.delivery_count = entry.delivery_count.saturating_add(1);
        entry.serial = serial;
        entry.fencing_token = self.fencing.issue(entry.fencing_token);
        entry.deadline_ns = deadline_ns;
        entry.owner = owner.cloned();
        if let Some(owner) = owner {
            owner.track(offset, serial, entry.bytes);
        }
        self.stats.record_delivery(entry.delivery_count);

        let token = AckToken {
            incarnation: self.incarnation,
            offset,
            serial,
            fencing_token: entry.fencing_token,
        };
        Ok(LeaseGrant {
            ack_id: token.encode(),
            delivery_count: entry.delivery_count,
            fencing_token: self.fencing.expose(entry.fencing_token),
            deadline_ns,
        })
    }

    /// Moves the deadline of the delivery named by `ack_id`.
    pub fn extend(
        &self,
        ack_id: &AckId,
        deadline_ns: u64,
        now_ns: u64,
        policy: &RedeliveryPolicy,
    ) -> Result<()> {
        let token = ack_id.decode()?;
        let mut shard = self.shard(token.offset);
        match self.resolve(&mut shard, ack_id, &token, now_ns, policy)? {
            Resolved::Current(entry) => {
                entry.deadline_ns = deadline_ns;
                Ok(())
            }
            Resolved::Settled => Err(Error::InvalidAckId(ack_id.to_string())),
        }
    }

    /// Client nack: LEASED -> PENDING without waiting for the deadline.
    pub fn release(&self, ack_id: &AckId, now_ns: u64, policy: &RedeliveryPolicy) -> Result<()> {
        let token = ack_id.decode()?;
        let mut shard = self.shard(token.offset);
        match self.resolve(&mut shard, ack_id, &token, now_ns, policy)? {
            Resolved::Current(entry) => {
                entry.requeue(token.offset, now_ns, policy);
                Ok(())
            }
            Resolved::Settled => Err(Error::InvalidAckId(ack_id.to_string())),
        }
    }

    pub fn acknowledge(
        &self,
        ack_id: &AckId,
        now_ns: u64,
        policy: &RedeliveryPolicy,
    ) -> Result<AckOutcome> {
        let token = ack_id.decode()?;
        let mut shard = self.shard(token.offset);
        match self.resolve(&mut shard, ack_id, &token, now_ns, policy)? {
            Resolved::Current(entry) => {
                entry.disown(token.offset);
                entry.state = LeaseState::Acked;
                Ok(AckOutcome::Acked)
            }
            Resolved::Settled => Ok(AckOutcome::AlreadyAcked),
        }
    }

    /// Validates `ack_id` against the entry it names. Overdue leases are
    /// expired on the way, which makes their ack ids invalid.
    fn resolve<'a>(
        &self,
        shard: &'a mut Shard,
        ack_id: &AckId,
        token: &AckToken,
        now_ns: u64,
        policy: &RedeliveryPolicy,
    ) -> Result<Resolved<'a>> {
        let invalid = || Error::InvalidAckId(ack_id.to_string());
        if token.incarnation != self.incarnation
            || token.serial == 0
            || token.serial >= self.next_serial.load(Ordering::Acquire)
        {
            return Err(invalid());
        }
        let Some(entry) = shard.get_mut(&token.offset) else {
            // Compaction publishes the new floor before removing entries.
            return if token.offset < self.floor() {
                Ok(Resolved::Settled)
            } else {
                Err(invalid())
            };
        };
        self.fencing
            .admit(ack_id, token, entry.serial, entry.fencing_token)?;
        match entry.state {
            LeaseState::Acked => Ok(Resolved::Settled),
            LeaseState::Pending | LeaseState::DeadLettered => Err(invalid()),
            LeaseState::Leased => {
                if entry.deadline_ns < now_ns {
                    entry.requeue(token.offset, now_ns, policy);
                    self.stats.record_expired(1);
                    return Err(invalid());
                }
                Ok(Resolved::Current(entry))
            }
        }
    }

    /// Expires every lease whose deadline is before `now_ns`.
    pub fn expire_sweep(&self, now_ns: u64, policy: &RedeliveryPolicy) -> usize {
        let mut expired = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            for (offset, entry) in shard.iter_mut() {
                if entry.state == LeaseState::Leased && entry.deadline_ns < now_ns {
                    entry.requeue(*offset, now_ns, policy);
                    expired += 1;
                }
            }
        }
        self.stats.record_expired(expired as u64);
        expired
    }

    /// Returns a lease held by a closing session to PENDING.
    pub(crate) fn release_owned(
        &self,
        offset: u64,
        serial: u64,
        session: SessionId,
        now_ns: u64,
        policy: &RedeliveryPolicy,
    ) -> bool {
        let mut shard = self.shard(offset);
        let Some(entry) = shard.get_mut(&offset) else {
            return false;
        };
        let owned = entry.state == LeaseState::Leased
            && entry.serial == serial
            && entry.owner.as_ref().is_some_and(|o| o.id() == session);
        if owned {
            entry.requeue(offset, now_ns, policy);
        }
        owned
    }

    /// Settles an undelivered message as dead-lettered. Returns its delivery
    /// count, or `None` if the message is not pending.
    pub(crate) fn mark_dead_lettered(&self, offset: u64, now_ns: u64) -> Option<u32> {
        let mut shard = self.shard(offset);
        let entry = shard.get_mut(&offset)?;
        if entry.state != LeaseState::Pending || entry.available_at_ns > now_ns {
            return None;
        }
        entry.state = LeaseState::DeadLettered;
        Some(entry.delivery_count)
    }

    /// Undoes [`LeaseTable::mark_dead_lettered`] when forwarding failed.
    pub(crate) fn revert_dead_letter(&self, offset: u64) {
        let mut shard = self.shard(offset);
        if let Some(entry) = shard.get_mut(&offset) {
            if entry.state == LeaseState::DeadLettered {
                entry.state = LeaseState::Pending;
            }
        }
    }

    /// Settles a message that outlived the subscription's retention without
    /// being delivered. Live leases are left alone.
    pub(crate) fn drop_expired_message(&self, offset: u64, now_ns: u64) -> bool {
        if offset < self.floor() {
            return false;
        }
        let mut shard = self.shard(offset);
        if offset < self.floor() {
            return false;
        }
        let entry = shard.entry(offset).or_insert_with(|| LeaseEntry::fresh(0));
        match entry.state {
            LeaseState::Pending => {
                entry.state = LeaseState::Acked;
                true
            }
            LeaseState::Leased if entry.deadline_ns < now_ns => {
                entry.disown(offset);
                entry.state = LeaseState::Acked;
                true
            }
            _ => false,
        }
    }

    /// Advances the ack floor over the contiguous settled prefix and drops
    /// those entries. Returns the new floor.
    pub fn compact(&self) -> u64 {
        let _guard = lock(&self.compaction);
        let mut floor = self.floor();
        loop {
            let mut shard = self.shard(floor);
            let settled = shard.get(&floor).is_some_and(|entry| entry.state.is_settled());
            if !settled {
                break;
            }
            self.floor.store(floor + 1, Ordering::Release);
            shard.remove(&floor);
            floor += 1;
        }
        floor
    }

    /// Offsets above the floor that are already settled.
    pub(crate) fn settled_above_floor(&self) -> BTreeSet<u64> {
        let mut settled = BTreeSet::new();
        for shard in self.shards.iter() {
            let shard = lock(shard);
            settled.extend(
                shard
                    .iter()
                    .filter(|(_, entry)| entry.state.is_settled())
                    .map(|(offset, _)| *offset),
            );
        }
        settled
    }

    /// Repositions the subscription: everything below `floor` and every
    /// offset in `acked` becomes settled, every other settled message becomes
    /// deliverable again. Returns how many live leases were invalidated.
    pub(crate) fn reset(&self, floor: u64, acked: &BTreeSet<u64>, now_ns: u64) -> usize {
        let _guard = lock(&self.compaction);
        self.floor.store(floor, Ordering::Release);
        let mut invalidated = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            shard.retain(|offset, entry| {
                let settle = *offset < floor || acked.contains(offset);
                if settle {
                    if entry.state == LeaseState::Leased {
                        invalidated += 1;
                    }
                    entry.disown(*offset);
                    entry.state = LeaseState::Acked;
                } else if entry.state.is_settled() {
                    entry.state = LeaseState::Pending;
                    entry.available_at_ns = now_ns;
                }
                *offset >= floor
            });
        }
        for offset in acked.range(floor..) {
            self.shard(*offset)
                .entry(*offset)
                .or_insert_with(LeaseEntry::tombstone);
        }
        invalidated
    }

    /// Drops every entry, releasing session credit. Used on deletion.
    pub(crate) fn clear(&self) -> usize {
        let mut cleared = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            for (offset, mut entry) in shard.drain() {
                if entry.state == LeaseState::Leased {
                    cleared += 1;
                }
                entry.disown(offset);
            }
        }
        cleared
    }

    /// Number of messages currently leased.
    pub fn outstanding(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                lock(shard)
                    .values()
                    .filter(|entry| entry.state == LeaseState::Leased)
                    .count()
            })
            .sum()
    }
}

fn view_of(entry: &LeaseEntry) -> LeaseView {
    LeaseView {
        state: entry.state,
        delivery_count: entry.delivery_count,
        fencing_token: entry.fencing_token,
        deadline_ns: entry.deadline_ns,
        available_at_ns: entry.available_at_ns,
        owner: entry.owner.as_ref().map(|o| o.id()),
        owner_alive: entry.owner.as_ref().map_or(true, |o| o.is_alive()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

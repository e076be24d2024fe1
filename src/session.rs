//! Streaming-pull sessions: flow-control credit, outstanding leases and close.
//!
//! A session is `Open` once registered, `Active` while it has credit to
//! receive more messages, and `Closed` after an explicit close, a transport
//! error, an idle timeout or subscription deletion. Closing is idempotent and
//! hands every outstanding lease back to the subscription exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::info;

use crate::context::SubscriptionContext;
use crate::{Error, Result};

pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    pub max_outstanding_messages: u64,
    pub max_outstanding_bytes: u64,
}

impl FlowControl {
    pub fn new(max_outstanding_messages: u64, max_outstanding_bytes: u64) -> Self {
        Self {
            max_outstanding_messages,
            max_outstanding_bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_messages == 0 || self.max_outstanding_bytes == 0 {
            return Err(Error::InvalidArgument(
                "flow control limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, but out of credit.
    Open,
    /// Connected and eligible for delivery.
    Active,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    IdleTimeout,
    SubscriptionDeleted,
    BrokerShutdown,
}

struct Outstanding {
    serial: u64,
    bytes: u64,
}

/// State of one session shared between its worker task, the lease table
/// (which records ownership) and the subscription's session registry.
pub struct SessionShared {
    id: SessionId,
    client_id: String,
    subscription: String,
    limits: FlowControl,
    stream_ack_deadline_ns: AtomicU64,
    outstanding_messages: AtomicU64,
    outstanding_bytes: AtomicU64,
    outstanding: Mutex<HashMap<u64, Outstanding>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    last_activity_ns: AtomicU64,
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("subscription", &self.subscription)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionShared {
    pub(crate) fn new(
        id: SessionId,
        client_id: String,
        subscription: String,
        limits: FlowControl,
        stream_ack_deadline: Duration,
        now_ns: u64,
    ) -> Self {
        Self {
            id,
            client_id,
            subscription,
            limits,
            stream_ack_deadline_ns: AtomicU64::new(crate::clock::duration_ns(stream_ack_deadline)),
            outstanding_messages: AtomicU64::new(0),
            outstanding_bytes: AtomicU64::new(0),
            outstanding: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            last_activity_ns: AtomicU64::new(now_ns),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn flow_control(&self) -> FlowControl {
        self.limits
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if !self.is_alive() {
            SessionState::Closed
        } else if self.has_credit() {
            SessionState::Active
        } else {
            SessionState::Open
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }

    pub fn has_credit(&self) -> bool {
        let (messages, bytes) = self.available_credit();
        messages > 0 && bytes > 0
    }

    /// Remaining `(messages, bytes)` this session may receive.
    pub fn available_credit(&self) -> (u64, u64) {
        let messages = self.outstanding_messages.load(Ordering::Acquire);
        let bytes = self.outstanding_bytes.load(Ordering::Acquire);
        (
            self.limits.max_outstanding_messages.saturating_sub(messages),
            self.limits.max_outstanding_bytes.saturating_sub(bytes),
        )
    }

    pub fn outstanding_len(&self) -> usize {
        lock(&self.outstanding).len()
    }

    pub fn stream_ack_deadline(&self) -> Duration {
        Duration::from_nanos(self.stream_ack_deadline_ns.load(Ordering::Acquire))
    }

    pub(crate) fn set_stream_ack_deadline(&self, deadline: Duration) {
        self.stream_ack_deadline_ns
            .store(crate::clock::duration_ns(deadline), Ordering::Release);
    }

    pub(crate) fn touch(&self, now_ns: u64) {
        self.last_activity_ns.fetch_max(now_ns, Ordering::AcqRel);
    }

    pub fn last_activity_ns(&self) -> u64 {
        self.last_activity_ns.load(Ordering::Acquire)
    }

    /// Records a lease granted to this session and consumes credit.
    pub(crate) fn track(&self, offset: u64, serial: u64, bytes: u64) {
        let mut outstanding = lock(&self.outstanding);
        if let Some(prev) = outstanding.insert(offset, Outstanding { serial, bytes }) {
            self.restore(prev.bytes);
        }
        self.outstanding_messages.fetch_add(1, Ordering::AcqRel);
        self.outstanding_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Drops a lease from this session (ack, nack, expiry or handover) and
    /// restores its credit. Returns false if the lease was not tracked here.
    pub(crate) fn settle(&self, offset: u64, serial: u64) -> bool {
        let mut outstanding = lock(&self.outstanding);
        match outstanding.get(&offset) {
            Some(entry) if entry.serial == serial => {
                let bytes = entry.bytes;
                outstanding.remove(&offset);
                self.restore(bytes);
                true
            }
            _ => false,
        }
    }

    fn restore(&self, bytes: u64) {
        let _ = self
            .outstanding_messages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
        let _ = self
            .outstanding_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Drains the outstanding set as `(offset, serial)` pairs.
    fn take_outstanding(&self) -> Vec<(u64, u64)> {
        let mut outstanding = lock(&self.outstanding);
        let drained = outstanding
            .drain()
            .map(|(offset, entry)| (offset, entry.serial))
            .collect();
        self.outstanding_messages.store(0, Ordering::Release);
        self.outstanding_bytes.store(0, Ordering::Release);
        drained
    }

    /// Marks the session closed. Only the first caller gets `true`.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.close_reason) = Some(reason);
        true
    }
}

/// The live sessions of one subscription.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<SessionShared>>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn open(
        &self,
        client_id: String,
        subscription: String,
        limits: FlowControl,
        stream_ack_deadline: Duration,
        now_ns: u64,
    ) -> Arc<SessionShared> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(SessionShared::new(
            id,
            client_id,
            subscription,
            limits,
            stream_ack_deadline,
            now_ns,
        ));
        lock(&self.sessions).insert(id, Arc::clone(&session));
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionShared>> {
        lock(&self.sessions).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<SessionShared>> {
        lock(&self.sessions).values().cloned().collect()
    }

    fn remove(&self, id: SessionId) {
        lock(&self.sessions).remove(&id);
    }
}

/// Closes `session` and returns its outstanding leases to PENDING.
///
/// Idempotent: only the first call performs the release sweep and returns true.
pub(crate) fn close_session(
    ctx: &SubscriptionContext,
    session: &Arc<SessionShared>,
    reason: CloseReason,
) -> bool {
    if !session.mark_closed(reason) {
        return false;
    }
    let now = ctx.now();
    let policy = ctx.redelivery_policy();
    let mut released = 0;
    for (offset, serial) in session.take_outstanding() {
        if ctx
            .leases()
            .release_owned(offset, serial, session.id(), now, &policy)
        {
            released += 1;
        }
    }
    ctx.sessions().remove(session.id());
    info!(
        "session {} ({}) on {} closed: {:?}, released {} leases",
        session.id(),
        session.client_id(),
        session.subscription(),
        reason,
        released
    );
    ctx.wake();
    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

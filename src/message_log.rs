//! The append-only message log the delivery engine reads from.
//!
//! The broker treats the log as an external collaborator behind the
//! [`MessageLog`] trait. [`InMemoryLog`] is the reference implementation used
//! by tests, benches and the soak binary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::message::{Message, PublishRequest};
use crate::retention;
use crate::{Error, Result};

const READ_CHUNK: usize = 256;

/// Append-only, per-topic store of published messages.
pub trait MessageLog: Send + Sync + 'static {
    fn create_topic(&self, topic: &str) -> Result<()>;

    fn topic_exists(&self, topic: &str) -> bool;

    /// Appends a message and assigns its id and offset.
    fn append(&self, topic: &str, request: PublishRequest, publish_time_ns: u64)
        -> Result<Arc<Message>>;

    /// Lazy, finite read starting at `offset` (or the oldest retained message
    /// if `offset` was compacted away), bounded by the end offset at call time.
    fn read_from(&self, topic: &str, offset: u64) -> Result<LogIter>;

    /// Offset the next appended message will receive.
    fn end_offset(&self, topic: &str) -> Result<u64>;

    /// First retained offset whose publish time is at or after `publish_time_ns`.
    fn offset_for_time(&self, topic: &str, publish_time_ns: u64) -> Result<u64>;

    /// Records that `subscription` no longer needs messages below `offset`.
    fn advance(&self, subscription: &str, topic: &str, offset: u64) -> Result<()>;

    /// Forgets a subscription's cursor so it no longer pins retention.
    fn detach(&self, subscription: &str, topic: &str);

    /// Drops messages no subscription needs. Returns `(topic, removed)` pairs
    /// for topics where anything was removed.
    fn compact(&self, _now_ns: u64) -> Vec<(String, u64)> {
        Vec::new()
    }
}

pub(crate) struct TopicState {
    pub base_offset: u64,
    pub messages: VecDeque<Arc<Message>>,
    pub cursors: HashMap<String, u64>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            base_offset: 0,
            messages: VecDeque::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.messages.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Arc<Message>> {
        let idx = offset.checked_sub(self.base_offset)?;
        self.messages.get(idx as usize)
    }
}

pub(crate) type TopicLog = RwLock<TopicState>;

/// Lazy, finite sequence of messages returned by [`MessageLog::read_from`].
pub type LogIter = Box<dyn Iterator<Item = Arc<Message>> + Send>;

/// Iterator over a topic that re-acquires the topic lock once per chunk.
struct TopicReader {
    topic: Arc<TopicLog>,
    next: u64,
    end: u64,
    buf: VecDeque<Arc<Message>>,
}

impl TopicReader {
    fn fill(&mut self) {
        let state = self.topic.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.next < state.base_offset {
            self.next = state.base_offset;
        }
        while self.buf.len() < READ_CHUNK && self.next < self.end {
            match state.get(self.next) {
                Some(message) => {
                    self.buf.push_back(Arc::clone(message));
                    self.next += 1;
                }
                None => {
                    self.end = self.next;
                    break;
                }
            }
        }
    }
}

impl Iterator for TopicReader {
    type Item = Arc<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            self.fill();
        }
        self.buf.pop_front()
    }
}

/// In-memory [`MessageLog`] with cursor-driven compaction.
pub struct InMemoryLog {
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    next_id: AtomicU64,
    retention_ns: Option<u64>,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            retention_ns: None,
        }
    }

    /// Messages older than `retention_ns` are compacted even if a cursor lags.
    pub fn with_retention_ns(mut self, retention_ns: u64) -> Self {
        self.retention_ns = Some(retention_ns);
        self
    }

    fn topic(&self, topic: &str) -> Result<Arc<TopicLog>> {
        let topics = self.topics.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))
    }

    fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        topics.keys().cloned().collect()
    }

    /// Number of messages currently retained for `topic`.
    pub fn retained(&self, topic: &str) -> Result<usize> {
        let topic = self.topic(topic)?;
        let state = read_state(&topic);
        Ok(state.messages.len())
    }
}

fn read_state(topic: &TopicLog) -> std::sync::RwLockReadGuard<'_, TopicState> {
    topic.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_state(topic: &TopicLog) -> std::sync::RwLockWriteGuard<'_, TopicState> {
    topic.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessageLog for InMemoryLog {
    fn create_topic(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::InvalidArgument("topic name cannot be empty".into()));
        }
        let mut topics = self.topics.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if topics.contains_key(topic) {
            return Err(Error::TopicExists(topic.to_string()));
        }
        topics.insert(topic.to_string(), Arc::new(RwLock::new(TopicState::new())));
        Ok(())
    }

    fn topic_exists(&self, topic: &str) -> bool {
        self.topic(topic).is_ok()
    }

    fn append(
        &self,
        topic: &str,
        request: PublishRequest,
        publish_time_ns: u64,
    ) -> Result<Arc<Message>> {
        let log = self.topic(topic)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = write_state(&log);
        let message = Arc::new(Message {
            id: id.to_string(),
            topic: topic.to_string(),
            offset: state.end_offset(),
            payload: request.payload,
            publish_time_ns,
            ordering_key: request.ordering_key.filter(|key| !key.is_empty()),
            attributes: request.attributes,
        });
        state.messages.push_back(Arc::clone(&message));
        Ok(message)
    }

    fn read_from(&self, topic: &str, offset: u64) -> Result<LogIter> {
        let log = self.topic(topic)?;
        let end = read_state(&log).end_offset();
        Ok(Box::new(TopicReader {
            topic: log,
            next: offset,
            end,
            buf: VecDeque::new(),
        }))
    }

    fn end_offset(&self, topic: &str) -> Result<u64> {
        let log = self.topic(topic)?;
        let end = read_state(&log).end_offset();
        Ok(end)
    }

    fn offset_for_time(&self, topic: &str, publish_time_ns: u64) -> Result<u64> {
        let log = self.topic(topic)?;
        let state = read_state(&log);
        // Publish times are assigned from the broker clock in append order.
        let idx = state
            .messages
            .partition_point(|message| message.publish_time_ns < publish_time_ns);
        Ok(state.base_offset + idx as u64)
    }

    fn advance(&self, subscription: &str, topic: &str, offset: u64) -> Result<()> {
        let log = self.topic(topic)?;
        let mut state = write_state(&log);
        state.cursors.insert(subscription.to_string(), offset);
        Ok(())
    }

    fn detach(&self, subscription: &str, topic: &str) {
        if let Ok(log) = self.topic(topic) {
            write_state(&log).cursors.remove(subscription);
        }
    }

    fn compact(&self, now_ns: u64) -> Vec<(String, u64)> {
        let horizon = self.retention_ns.map(|ns| now_ns.saturating_sub(ns));
        let mut removed = Vec::new();
        for name in self.topic_names() {
            let Ok(topic) = self.topic(&name) else {
                continue;
            };
            let mut state = write_state(&topic);
            let count = retention::compact_topic(&mut state, horizon);
            if count > 0 {
                debug!("compacted {count} messages from topic {name}");
                removed.push((name, count));
            }
        }
        removed
    }
}

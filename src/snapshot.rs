//! Named snapshots of a subscription's acknowledgement state, and seek targets.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::{Error, Result};

/// Where a seek repositions a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekTarget {
    /// Messages published before this instant (ns) count as acknowledged,
    /// everything at or after it is delivered again.
    Time(u64),
    /// Restore the acknowledgement state captured by a snapshot.
    Snapshot(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub topic: String,
    /// Ack floor when the snapshot was taken.
    pub floor: u64,
    /// Offsets above `floor` that were already settled.
    pub acked: BTreeSet<u64>,
    pub created_at_ns: u64,
    pub expire_at_ns: u64,
}

impl Snapshot {
    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.expire_at_ns <= now_ns
    }
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.lock();
        if snapshots.contains_key(&snapshot.name) {
            return Err(Error::SnapshotExists(snapshot.name));
        }
        snapshots.insert(snapshot.name.clone(), snapshot);
        Ok(())
    }

    /// Returns a live snapshot; expired ones are reported as missing.
    pub fn get(&self, name: &str, now_ns: u64) -> Result<Snapshot> {
        self.lock()
            .get(name)
            .filter(|snapshot| !snapshot.is_expired(now_ns))
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Result<Snapshot> {
        self.lock()
            .remove(name)
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
    }

    pub fn list(&self, now_ns: u64) -> Vec<Snapshot> {
        let mut snapshots: Vec<_> = self
            .lock()
            .values()
            .filter(|snapshot| !snapshot.is_expired(now_ns))
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Drops expired snapshots, returning how many were removed.
    pub fn expire(&self, now_ns: u64) -> usize {
        let mut snapshots = self.lock();
        let before = snapshots.len();
        snapshots.retain(|_, snapshot| !snapshot.is_expired(now_ns));
        before - snapshots.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Snapshot>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Bounded LRU set of chunk hashes whose stored bytes were verified.
//!
//! A repeated put under [`VerifyPolicy::Cached`] skips re-reading a chunk
//! this process has already hashed. Entries are dropped when a read finds
//! corruption or a sweep reclaims the chunk.
//!
//! [`VerifyPolicy::Cached`]: tessera_types::VerifyPolicy::Cached

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tessera_types::ChunkHash;
use tracing::trace;

/// Thread-safe LRU set of verified chunk hashes.
pub struct VerifiedSet {
    capacity: usize,
    inner: Mutex<SetInner>,
}

struct SetInner {
    /// Access order: front = oldest (eviction candidate), back = newest.
    order: VecDeque<ChunkHash>,
    members: HashSet<ChunkHash>,
}

impl VerifiedSet {
    /// Create a set holding at most `capacity` hashes.
    ///
    /// A capacity of 0 disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(SetInner {
                order: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    /// Record a verified hash, evicting the oldest entry if full.
    pub fn insert(&self, hash: ChunkHash) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.members.contains(&hash) {
            inner.order.retain(|h| *h != hash);
        } else {
            while inner.members.len() >= self.capacity {
                let Some(evicted) = inner.order.pop_front() else {
                    break;
                };
                inner.members.remove(&evicted);
                trace!(%evicted, "evicted verified hash");
            }
            inner.members.insert(hash);
        }
        inner.order.push_back(hash);
    }

    /// Whether `hash` was verified, promoting it to most-recently-used.
    pub fn contains(&self, hash: &ChunkHash) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if !inner.members.contains(hash) {
            return false;
        }
        inner.order.retain(|h| h != hash);
        inner.order.push_back(*hash);
        true
    }

    /// Forget a hash.
    pub fn remove(&self, hash: &ChunkHash) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.members.remove(hash) {
            inner.order.retain(|h| h != hash);
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

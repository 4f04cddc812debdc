//! In-memory key-value backend.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::error::KvError;
use crate::traits::{KvStore, ScanPage, decode_counter, encode_counter, finish_page};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory key-value store backed by a `RwLock<BTreeMap>`.
///
/// Expired entries are dropped lazily when a write touches them. Expiry
/// follows the tokio clock, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Entry>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a value without any of the atomic guards, keeping its TTL.
    ///
    /// Simulates out-of-band corruption or a foreign writer in tests.
    pub fn overwrite(&self, key: &[u8], value: Bytes) {
        let mut map = self.entries.write().expect("lock poisoned");
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(key.to_vec(), Entry { value, expires_at });
    }

    /// Remove a key unconditionally (simulates data loss in tests).
    pub fn remove(&self, key: &[u8]) -> bool {
        let mut map = self.entries.write().expect("lock poisoned");
        map.remove(key).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.entries.read().expect("lock poisoned");
        map.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.write().expect("lock poisoned");
        let before = map.len();
        map.retain(|_, e| e.is_live(now));
        before - map.len()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.entries.write().expect("lock poisoned");
        if map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        trace!(key = %String::from_utf8_lossy(key), size = value.len(), "set");
        map.insert(
            key.to_vec(),
            Entry {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, KvError> {
        let now = Instant::now();
        let map = self.entries.read().expect("lock poisoned");
        Ok(map
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut map = self.entries.write().expect("lock poisoned");
        let (current, expires_at) = match map.get(key).filter(|e| e.is_live(now)) {
            Some(entry) => (
                decode_counter(&entry.value).ok_or_else(|| KvError::not_a_counter(key))?,
                entry.expires_at,
            ),
            None => (0, None),
        };
        let updated = current.wrapping_add(delta);
        map.insert(
            key.to_vec(),
            Entry {
                value: encode_counter(updated),
                expires_at,
            },
        );
        Ok(updated)
    }

    async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.entries.write().expect("lock poisoned");
        match map.get(key) {
            Some(e) if e.is_live(now) && e.value.as_ref() == expected => {
                map.remove(key);
                Ok(true)
            }
            Some(e) if !e.is_live(now) => {
                map.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.entries.write().expect("lock poisoned");
        match map.get_mut(key) {
            Some(e) if e.is_live(now) => {
                e.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage, KvError> {
        let now = Instant::now();
        let map = self.entries.read().expect("lock poisoned");
        let start = match after {
            Some(cursor) if cursor >= prefix => Bound::Excluded(cursor.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let keys: Vec<Vec<u8>> = map
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();
        Ok(finish_page(keys, limit))
    }
}

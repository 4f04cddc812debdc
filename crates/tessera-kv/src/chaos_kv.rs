//! A [`KvStore`] wrapper that injects latency and failures.
//!
//! `ChaosKv` wraps any `Arc<dyn KvStore>`, sleeps for a seeded random
//! duration before each call, and fails calls according to rules that can
//! be changed while the store is in use.
//!
//! # Example
//!
//! ```ignore
//! let chaos = ChaosKv::new(inner).latency(1, 5).seed(42);
//! chaos.fail_nth_write(3);              // third write from now fails once
//! chaos.fail_matching(b"chunk/");       // every op on chunk keys fails
//! chaos.set_offline(true);              // everything fails
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::KvError;
use crate::traits::{KvStore, ScanPage};

#[derive(Debug, Default)]
struct FaultRules {
    /// Fail exactly one write when the write counter reaches this value.
    nth_write: Option<u64>,
    /// Fail every write once the write counter reaches this value.
    writes_after: Option<u64>,
    /// Fail any op whose key contains this pattern.
    key_pattern: Option<Vec<u8>>,
}

/// A [`KvStore`] wrapper for fault-injection tests.
pub struct ChaosKv {
    inner: Arc<dyn KvStore>,
    latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    offline: AtomicBool,
    writes: AtomicU64,
    injected: AtomicU64,
    rules: Mutex<FaultRules>,
}

impl ChaosKv {
    /// Wrap an existing store with no latency and no faults.
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            offline: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            injected: AtomicU64::new(0),
            rules: Mutex::new(FaultRules::default()),
        }
    }

    /// Set the per-call latency range in milliseconds (uniform random).
    pub fn latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Fail every call while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the `n`-th write issued from now on (1-based), once.
    pub fn fail_nth_write(&self, n: u64) {
        let base = self.writes.load(Ordering::SeqCst);
        self.rules.lock().expect("lock poisoned").nth_write = Some(base + n);
    }

    /// Let `n` more writes through, then fail every write.
    pub fn fail_writes_after(&self, n: u64) {
        let base = self.writes.load(Ordering::SeqCst);
        self.rules.lock().expect("lock poisoned").writes_after = Some(base + n);
    }

    /// Fail every call on a key containing `pattern`.
    pub fn fail_matching(&self, pattern: &[u8]) {
        self.rules.lock().expect("lock poisoned").key_pattern = Some(pattern.to_vec());
    }

    /// Remove all fault rules and bring the store back online.
    pub fn heal(&self) {
        self.set_offline(false);
        *self.rules.lock().expect("lock poisoned") = FaultRules::default();
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let (min, max) = self.latency_ms;
        if max == 0 {
            return;
        }
        let ms = if min == max {
            min
        } else {
            self.rng.lock().expect("lock poisoned").random_range(min..=max)
        };
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Apply the rules to one call. Writes advance the write counter.
    async fn check(&self, key: &[u8], is_write: bool) -> Result<(), KvError> {
        self.delay().await;

        let fault = if self.offline.load(Ordering::SeqCst) {
            Some("store offline")
        } else {
            let mut rules = self.rules.lock().expect("lock poisoned");
            if rules
                .key_pattern
                .as_deref()
                .is_some_and(|p| contains(key, p))
            {
                Some("key matches fault pattern")
            } else if is_write {
                let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
                if rules.nth_write == Some(n) {
                    rules.nth_write = None;
                    Some("nth write fault")
                } else if rules.writes_after.is_some_and(|after| n > after) {
                    Some("write fault")
                } else {
                    None
                }
            } else {
                None
            }
        };

        match fault {
            Some(reason) => {
                self.injected.fetch_add(1, Ordering::SeqCst);
                debug!(key = %String::from_utf8_lossy(key), reason, "injecting failure");
                Err(KvError::Unavailable(format!("injected: {reason}")))
            }
            None => Ok(()),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[async_trait::async_trait]
impl KvStore for ChaosKv {
    async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.check(key, true).await?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, KvError> {
        self.check(key, false).await?;
        self.inner.get(key).await
    }

    async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64, KvError> {
        self.check(key, true).await?;
        self.inner.atomic_add(key, delta).await
    }

    async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool, KvError> {
        self.check(key, true).await?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool, KvError> {
        self.check(key, true).await?;
        self.inner.refresh_ttl(key, ttl).await
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage, KvError> {
        self.check(prefix, false).await?;
        self.inner.scan_prefix(prefix, after, limit).await
    }
}

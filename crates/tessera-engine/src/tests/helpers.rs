//! Shared test utilities for tessera-engine tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tessera_kv::{ChaosKv, KvError, KvStore, MemoryKv, ScanPage};
use tessera_types::{ChunkHash, ChunkerConfig, EngineConfig, GcConfig, StoreConfig};

use crate::refs::RefState;
use crate::tessera::Tessera;

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    test_data_seeded(size, 0xDEAD_BEEF)
}

/// Like [`test_data`] with a caller-chosen seed.
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Small chunks so a few kilobytes produce many of them.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        key_prefix: "test:".to_string(),
        max_payload_size: 1024 * 1024,
        chunking: ChunkerConfig {
            min_size: 64,
            avg_size: 256,
            max_size: 1024,
            window_size: 16,
        },
        store: StoreConfig {
            op_timeout_ms: 1_000,
            reclaim_retries: 4,
            reclaim_backoff_ms: 1,
            ..StoreConfig::default()
        },
        gc: GcConfig {
            batch_size: 64,
            pending_timeout_secs: 60,
            tombstone_ttl_secs: 10,
            ..GcConfig::default()
        },
    }
}

/// Fixed-size chunks of `size` bytes.
pub fn fixed_config(size: u32) -> EngineConfig {
    let mut config = small_config();
    config.chunking = ChunkerConfig {
        min_size: size,
        avg_size: size,
        max_size: size,
        window_size: size.min(ChunkerConfig::MAX_WINDOW),
    };
    config
}

/// Engine over a fresh in-memory store.
pub fn engine_with(config: EngineConfig) -> (Arc<MemoryKv>, Tessera) {
    let mem = Arc::new(MemoryKv::new());
    let engine = Tessera::new(config, mem.clone()).unwrap();
    (mem, engine)
}

/// Engine with [`small_config`].
pub fn engine() -> (Arc<MemoryKv>, Tessera) {
    engine_with(small_config())
}

/// Engine whose collaborator can be made to fail.
pub fn chaos_engine(config: EngineConfig) -> (Arc<ChaosKv>, Arc<MemoryKv>, Tessera) {
    let mem = Arc::new(MemoryKv::new());
    let chaos = Arc::new(ChaosKv::new(mem.clone()));
    let engine = Tessera::new(config, chaos.clone()).unwrap();
    (chaos, mem, engine)
}

/// Current counter value, with absent or reclaiming read as 0.
pub async fn ref_count(engine: &Tessera, hash: &ChunkHash) -> i64 {
    match engine.refs().state(hash).await.unwrap() {
        RefState::Count(n) => n,
        RefState::Absent | RefState::Reclaiming => 0,
    }
}

/// Number of chunk entries physically stored.
pub async fn stored_chunks(engine: &Tessera) -> usize {
    engine
        .kv()
        .scan_all(&engine.keys().chunk_prefix(), 100)
        .await
        .unwrap()
        .len()
}

/// Work injected into the middle of another operation.
type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

fn boxed<F, Fut>(action: F) -> Hook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || {
        let fut: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(action());
        fut
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HookPoint {
    /// Before a fresh scan whose prefix contains the pattern.
    Scan,
    /// After a read of a key containing the pattern has returned.
    Get,
}

struct PendingHook {
    point: HookPoint,
    pattern: Vec<u8>,
    remaining: usize,
    action: Option<Hook>,
}

/// A [`KvStore`] that runs hooks at chosen calls, for deterministic
/// interleavings of one engine's work inside another's.
pub struct HookedKv {
    inner: Arc<MemoryKv>,
    hooks: Mutex<Vec<PendingHook>>,
}

impl HookedKv {
    pub fn new(inner: Arc<MemoryKv>) -> Self {
        Self {
            inner,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Run `action` before the `nth` scan (1-based) of a prefix containing
    /// `pattern`. Continuation pages do not count.
    pub fn before_scan<F, Fut>(&self, pattern: &[u8], nth: usize, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(HookPoint::Scan, pattern, nth, boxed(action));
    }

    /// Run `action` after the `nth` read (1-based) of a key containing
    /// `pattern`, before the value is handed back.
    pub fn after_get<F, Fut>(&self, pattern: &[u8], nth: usize, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(HookPoint::Get, pattern, nth, boxed(action));
    }

    fn add(&self, point: HookPoint, pattern: &[u8], nth: usize, action: Hook) {
        self.hooks.lock().unwrap().push(PendingHook {
            point,
            pattern: pattern.to_vec(),
            remaining: nth,
            action: Some(action),
        });
    }

    async fn fire(&self, point: HookPoint, key: &[u8]) {
        let due: Vec<Hook> = {
            let mut hooks = self.hooks.lock().unwrap();
            hooks
                .iter_mut()
                .filter(|h| h.point == point && h.action.is_some())
                .filter(|h| key.windows(h.pattern.len()).any(|w| w == h.pattern.as_slice()))
                .filter_map(|h| {
                    h.remaining -= 1;
                    if h.remaining == 0 { h.action.take() } else { None }
                })
                .collect()
        };
        for action in due {
            action().await;
        }
    }
}

#[async_trait::async_trait]
impl KvStore for HookedKv {
    async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, KvError> {
        let value = self.inner.get(key).await;
        self.fire(HookPoint::Get, key).await;
        value
    }

    async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64, KvError> {
        self.inner.atomic_add(key, delta).await
    }

    async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool, KvError> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool, KvError> {
        self.inner.refresh_ttl(key, ttl).await
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage, KvError> {
        if after.is_none() {
            self.fire(HookPoint::Scan, prefix).await;
        }
        self.inner.scan_prefix(prefix, after, limit).await
    }
}

//! Shared test harness for Tessera integration tests.
//!
//! Provides [`Deployment`]: several independent [`Tessera`] engines over one
//! key-value store, the way separate worker processes share a namespace.
//! The store can be wrapped in a [`ChaosKv`] to inject failures.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_engine::{DriftReport, RefState, Tessera};
use tessera_kv::{ChaosKv, KvStore, MemoryKv};
use tessera_types::{ChunkHash, ChunkerConfig, EngineConfig, GcConfig, Manifest, StoreConfig};

// =========================================================================
// Configurations
// =========================================================================

/// Small chunks and short timeouts so tests stay fast.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        key_prefix: "it:".to_string(),
        max_payload_size: 8 * 1024 * 1024,
        chunking: ChunkerConfig {
            min_size: 256,
            avg_size: 1_024,
            max_size: 4_096,
            window_size: 32,
        },
        store: StoreConfig {
            op_timeout_ms: 200,
            reclaim_retries: 6,
            reclaim_backoff_ms: 2,
            ..StoreConfig::default()
        },
        gc: GcConfig {
            interval_secs: 1,
            batch_size: 128,
            pending_timeout_secs: 2,
            tombstone_ttl_secs: 1,
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

// =========================================================================
// Deployment
// =========================================================================

/// N engines sharing one namespace on one store.
pub struct Deployment {
    mem: Arc<MemoryKv>,
    chaos: Option<Arc<ChaosKv>>,
    engines: Vec<Arc<Tessera>>,
}

impl Deployment {
    /// `n` engines directly on a fresh in-memory store.
    pub fn new(n: usize, config: EngineConfig) -> Self {
        let mem = Arc::new(MemoryKv::new());
        let engines = (0..n)
            .map(|_| Arc::new(Tessera::new(config.clone(), mem.clone()).unwrap()))
            .collect();
        Self {
            mem,
            chaos: None,
            engines,
        }
    }

    /// `n` engines behind a shared fault injector with the given latency
    /// range (milliseconds) and seed.
    pub fn with_chaos(n: usize, config: EngineConfig, latency_ms: (u64, u64), seed: u64) -> Self {
        let mem = Arc::new(MemoryKv::new());
        let chaos = Arc::new(
            ChaosKv::new(mem.clone())
                .latency(latency_ms.0, latency_ms.1)
                .seed(seed),
        );
        let engines = (0..n)
            .map(|_| {
                let kv: Arc<dyn KvStore> = chaos.clone();
                Arc::new(Tessera::new(config.clone(), kv).unwrap())
            })
            .collect();
        Self {
            mem,
            chaos: Some(chaos),
            engines,
        }
    }

    /// Engine `i`.
    pub fn engine(&self, i: usize) -> &Arc<Tessera> {
        &self.engines[i]
    }

    /// Number of engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether the deployment has no engines.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// The raw store, for out-of-band tampering.
    pub fn mem(&self) -> &Arc<MemoryKv> {
        &self.mem
    }

    /// The fault injector, if any.
    pub fn chaos(&self) -> &ChaosKv {
        self.chaos.as_deref().expect("deployment built without chaos")
    }

    /// Reference counts implied by every committed manifest.
    pub async fn expected_counts(&self) -> HashMap<ChunkHash, i64> {
        let mut expected = HashMap::new();
        for manifest in self.engine(0).registry().manifests().await.unwrap() {
            for hash in manifest.hashes() {
                *expected.entry(hash).or_default() += 1;
            }
        }
        expected
    }

    /// Current value of a counter, absent read as 0.
    pub async fn ref_count(&self, hash: &ChunkHash) -> i64 {
        match self.engine(0).refs().state(hash).await.unwrap() {
            RefState::Count(n) => n,
            RefState::Absent => 0,
            RefState::Reclaiming => panic!("{hash} is mid-reclaim"),
        }
    }

    /// Assert the reference invariant and that every manifest reconstructs.
    pub async fn assert_consistent(&self) -> DriftReport {
        let engine = self.engine(0);
        let expected = self.expected_counts().await;
        for (hash, count) in &expected {
            assert_eq!(self.ref_count(hash).await, *count, "counter for {hash}");
        }
        for manifest in engine.registry().manifests().await.unwrap() {
            engine
                .reconstruct(&manifest)
                .await
                .unwrap_or_else(|e| panic!("manifest {} unreadable: {e}", manifest.id));
        }

        let report = engine.audit(true).await.unwrap();
        assert!(report.repairs.is_empty(), "drift left behind: {report:?}");
        assert!(report.dangling.is_empty(), "dangling chunks: {report:?}");
        report
    }

    /// Number of chunk entries stored.
    pub async fn stored_chunks(&self) -> usize {
        let engine = self.engine(0);
        engine
            .kv()
            .scan_all(&engine.keys().chunk_prefix(), 256)
            .await
            .unwrap()
            .len()
    }
}

/// Reconstruct `manifest` and compare with `payload`.
pub async fn assert_roundtrip(engine: &Tessera, manifest: &Manifest, payload: &[u8]) {
    let rebuilt = engine.reconstruct(manifest).await.unwrap();
    assert_eq!(rebuilt.len(), payload.len(), "length of {}", manifest.id);
    assert!(rebuilt == payload, "payload mismatch for {}", manifest.id);
}

// =========================================================================
// Data
// =========================================================================

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

/// A synthetic CI build log: long shared setup, a few job-specific lines.
///
/// Logs of the same `project` share everything but the lines derived from
/// `job`, like consecutive runs of one pipeline.
pub fn build_log(project: u32, job: u32) -> Vec<u8> {
    let mut log = String::new();
    for step in 0..2_000u32 {
        let noise = test_data_seeded(24, project * 10_000 + step);
        let hex: String = noise.iter().map(|b| format!("{b:02x}")).collect();
        log.push_str(&format!("[{project:04}] step {step:03} fetching layer {hex}\n"));
        if step % 500 == 499 {
            log.push_str(&format!("[{project:04}] job {job} checkpoint {step}\n"));
        }
    }
    log.push_str(&format!("job {job} finished\n"));
    log.into_bytes()
}

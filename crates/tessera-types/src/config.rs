//! Engine configuration.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial TOML
//! section only overrides the fields it names. Durations are stored as
//! integer seconds or milliseconds and exposed as [`Duration`] accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error returned by the `validate` methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError(msg.into())
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Content-defined chunking parameters.
///
/// Changing any of these after data has been stored does not break
/// reconstruction, but new payloads will no longer share chunks with old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// No boundary is placed before this many bytes.
    pub min_size: u32,
    /// Target average chunk size.
    pub avg_size: u32,
    /// A boundary is always placed at this many bytes.
    pub max_size: u32,
    /// Rolling hash window in bytes.
    pub window_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 2_048,  // 2 KB
            avg_size: 8_192,  // 8 KB
            max_size: 32_768, // 32 KB
            window_size: 64,
        }
    }
}

impl ChunkerConfig {
    /// Largest accepted rolling-hash window.
    pub const MAX_WINDOW: u32 = 256;

    /// Check `1 <= min <= avg <= max` and the window bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 {
            return Err(invalid("chunking.min_size must be > 0"));
        }
        if self.avg_size < self.min_size {
            return Err(invalid(format!(
                "chunking.avg_size ({}) must be >= min_size ({})",
                self.avg_size, self.min_size
            )));
        }
        if self.max_size < self.avg_size {
            return Err(invalid(format!(
                "chunking.max_size ({}) must be >= avg_size ({})",
                self.max_size, self.avg_size
            )));
        }
        if self.window_size == 0 || self.window_size > Self::MAX_WINDOW {
            return Err(invalid(format!(
                "chunking.window_size ({}) must be in 1..={}",
                self.window_size,
                Self::MAX_WINDOW
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Content store
// ---------------------------------------------------------------------------

/// How an already-present chunk is checked on a repeated put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPolicy {
    /// Re-read and re-hash the stored bytes on every repeated put.
    Always,
    /// Trust hashes this process has already verified (bounded LRU).
    Cached,
}

/// Content store and collaborator access settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Chunk TTL, refreshed on every read and every new reference.
    pub chunk_ttl_secs: u64,
    /// Upper bound on any single key-value call.
    pub op_timeout_ms: u64,
    /// Collision check policy for repeated puts.
    pub verify: VerifyPolicy,
    /// Capacity of the verified-hash cache used by [`VerifyPolicy::Cached`].
    pub verified_cache_capacity: usize,
    /// Attempts to take a reference on a hash that is being reclaimed.
    pub reclaim_retries: u32,
    /// Initial backoff between those attempts, doubled each time.
    pub reclaim_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_ttl_secs: 7 * 24 * 3600, // 7 days
            op_timeout_ms: 2_000,
            verify: VerifyPolicy::Cached,
            verified_cache_capacity: 65_536,
            reclaim_retries: 6,
            reclaim_backoff_ms: 10,
        }
    }
}

impl StoreConfig {
    /// Chunk TTL as a [`Duration`].
    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_secs)
    }

    /// Per-call timeout as a [`Duration`].
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// First reclaim backoff as a [`Duration`].
    pub fn reclaim_backoff(&self) -> Duration {
        Duration::from_millis(self.reclaim_backoff_ms)
    }

    /// Longest a store waits out a reclaim: the sum of every backoff.
    pub fn reclaim_wait(&self) -> Duration {
        let doublings = 1u64.checked_shl(self.reclaim_retries).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.reclaim_backoff_ms
                .saturating_mul(doublings.saturating_sub(1)),
        )
    }

    /// Reject zero timeouts and TTLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_ttl_secs == 0 {
            return Err(invalid("store.chunk_ttl_secs must be > 0"));
        }
        if self.op_timeout_ms == 0 {
            return Err(invalid("store.op_timeout_ms must be > 0"));
        }
        if self.verify == VerifyPolicy::Cached && self.verified_cache_capacity == 0 {
            return Err(invalid(
                "store.verified_cache_capacity must be > 0 with the cached policy",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Garbage collection
// ---------------------------------------------------------------------------

/// Sweep and audit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Interval between background sweeps.
    pub interval_secs: u64,
    /// Maximum reference counters examined per sweep batch.
    pub batch_size: usize,
    /// Age after which an uncommitted intent is treated as abandoned.
    pub pending_timeout_secs: u64,
    /// Lease held by a sweeper while it reclaims one chunk.
    pub tombstone_ttl_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,        // 1 hour
            batch_size: 1_000,
            pending_timeout_secs: 900,   // 15 minutes
            tombstone_ttl_secs: 300,     // 5 minutes
        }
    }
}

impl GcConfig {
    /// Sweep interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Abandonment window as a [`Duration`].
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    /// Store operations must commit within this deadline.
    ///
    /// Half the abandonment window, so audit never reaps a live producer.
    pub fn commit_deadline(&self) -> Duration {
        self.pending_timeout() / 2
    }

    /// Reclaim lease as a [`Duration`].
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    /// Reject zero-sized batches and windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("gc.batch_size must be > 0"));
        }
        if self.interval_secs == 0 {
            return Err(invalid("gc.interval_secs must be > 0"));
        }
        if self.pending_timeout_secs < 2 {
            return Err(invalid("gc.pending_timeout_secs must be >= 2"));
        }
        if self.tombstone_ttl_secs == 0 {
            return Err(invalid("gc.tombstone_ttl_secs must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Opaque namespace prepended to every key-value key.
    pub key_prefix: String,
    /// Payloads larger than this are rejected.
    pub max_payload_size: u64,
    /// Chunking parameters.
    pub chunking: ChunkerConfig,
    /// Content store settings.
    pub store: StoreConfig,
    /// Sweep and audit settings.
    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "dedup:".to_string(),
            max_payload_size: 64 * 1024 * 1024, // 64 MB
            chunking: ChunkerConfig::default(),
            store: StoreConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_size == 0 {
            return Err(invalid("max_payload_size must be > 0"));
        }
        self.chunking.validate()?;
        self.store.validate()?;
        self.gc.validate()?;

        // A reclaim must delete its chunk (two calls) within half the lease.
        let op_ms = self.store.op_timeout_ms;
        if self.gc.tombstone_ttl_secs.saturating_mul(1_000) < op_ms.saturating_mul(4) {
            return Err(invalid(format!(
                "gc.tombstone_ttl_secs must cover at least 4 x store.op_timeout_ms ({op_ms} ms)"
            )));
        }
        // A store must outlast the lease of a sweeper that died mid-reclaim.
        let wait = self.store.reclaim_wait();
        if self.gc.tombstone_ttl() <= wait {
            return Err(invalid(format!(
                "gc.tombstone_ttl_secs must exceed the total reclaim backoff ({} ms)",
                wait.as_millis()
            )));
        }
        if (self.gc.commit_deadline().as_millis() as u64) <= op_ms {
            return Err(invalid(format!(
                "gc.pending_timeout_secs must exceed 2 x store.op_timeout_ms ({op_ms} ms)"
            )));
        }
        Ok(())
    }
}

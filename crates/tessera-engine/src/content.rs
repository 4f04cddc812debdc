//! Hash-addressed chunk storage on top of the key-value collaborator.
//!
//! Puts are idempotent: the first writer wins through `set_if_absent` and
//! later writers verify what is already there instead of rewriting it.
//! Gets always re-hash what they read and fail closed on a mismatch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_types::{ChunkHash, StoreConfig, VerifyPolicy};
use tracing::{debug, error, warn};

use crate::cache::VerifiedSet;
use crate::error::EngineError;
use crate::keys::KeySpace;
use crate::kv::BoundedKv;

/// Attempts made when a chunk vanishes between the write and the verify read.
const PUT_ATTEMPTS: usize = 3;

/// Result of [`ContentStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk was absent and has been written.
    Stored,
    /// The chunk already existed and its bytes match the address.
    AlreadyPresentVerified,
    /// The chunk already existed but its bytes hash to something else.
    CollisionDetected {
        /// The hash of the stored bytes.
        actual: ChunkHash,
    },
}

/// Content-addressed chunk store.
pub struct ContentStore {
    kv: BoundedKv,
    keys: Arc<KeySpace>,
    ttl: Duration,
    policy: VerifyPolicy,
    verified: VerifiedSet,
}

impl ContentStore {
    /// Create a content store over `kv` using the given settings.
    pub fn new(kv: BoundedKv, keys: Arc<KeySpace>, config: &StoreConfig) -> Self {
        Self {
            kv,
            keys,
            ttl: config.chunk_ttl(),
            policy: config.verify,
            verified: VerifiedSet::new(config.verified_cache_capacity),
        }
    }

    /// Store a chunk unless an entry for `hash` already exists.
    ///
    /// `data` itself must hash to `hash`; a caller passing mismatched bytes
    /// gets [`EngineError::IntegrityMismatch`] and nothing is written.
    pub async fn put(&self, hash: ChunkHash, data: Bytes) -> Result<PutOutcome, EngineError> {
        let actual = ChunkHash::from_data(&data);
        if actual != hash {
            return Err(EngineError::IntegrityMismatch { hash, actual });
        }

        let key = self.keys.chunk(&hash);
        for _ in 0..PUT_ATTEMPTS {
            if self
                .kv
                .set_if_absent(&key, data.clone(), Some(self.ttl))
                .await?
            {
                debug!(%hash, size = data.len(), "stored new chunk");
                self.verified.insert(hash);
                return Ok(PutOutcome::Stored);
            }

            if self.policy == VerifyPolicy::Cached && self.verified.contains(&hash) {
                self.kv.refresh_ttl(&key, self.ttl).await?;
                return Ok(PutOutcome::AlreadyPresentVerified);
            }

            let Some(existing) = self.kv.get(&key).await? else {
                // Expired or reclaimed since the write attempt.
                continue;
            };
            let actual = ChunkHash::from_data(&existing);
            if actual != hash {
                self.verified.remove(&hash);
                error!(%hash, %actual, "stored chunk does not match its address");
                return Ok(PutOutcome::CollisionDetected { actual });
            }
            self.verified.insert(hash);
            self.kv.refresh_ttl(&key, self.ttl).await?;
            return Ok(PutOutcome::AlreadyPresentVerified);
        }

        Err(EngineError::StoreUnavailable(tessera_kv::KvError::Unavailable(
            format!("chunk {hash} kept disappearing during put"),
        )))
    }

    /// Fetch and verify a chunk. Returns `None` only if no entry exists.
    ///
    /// A successful read refreshes the chunk's TTL.
    pub async fn get(&self, hash: &ChunkHash) -> Result<Option<Bytes>, EngineError> {
        let key = self.keys.chunk(hash);
        let Some(data) = self.kv.get(&key).await? else {
            return Ok(None);
        };

        let actual = ChunkHash::from_data(&data);
        if actual != *hash {
            self.verified.remove(hash);
            warn!(%hash, %actual, "chunk failed verification on read");
            return Err(EngineError::IntegrityMismatch {
                hash: *hash,
                actual,
            });
        }

        if let Err(e) = self.kv.refresh_ttl(&key, self.ttl).await {
            warn!(%hash, error = %e, "failed to refresh chunk ttl after read");
        }
        Ok(Some(data))
    }

    /// Whether an entry exists for `hash`, without verifying it.
    pub async fn contains(&self, hash: &ChunkHash) -> Result<bool, EngineError> {
        Ok(self.kv.get(&self.keys.chunk(hash)).await?.is_some())
    }

    /// Extend a chunk's TTL. Returns `false` if the chunk is absent.
    pub async fn touch(&self, hash: &ChunkHash) -> Result<bool, EngineError> {
        self.kv.refresh_ttl(&self.keys.chunk(hash), self.ttl).await
    }

    /// Delete a chunk entry. Only the sweeper calls this.
    pub(crate) async fn remove(&self, hash: &ChunkHash) -> Result<bool, EngineError> {
        let key = self.keys.chunk(hash);
        self.verified.remove(hash);
        match self.kv.get(&key).await? {
            Some(existing) => self.kv.delete_if_equals(&key, &existing).await,
            None => Ok(false),
        }
    }

    /// Number of hashes in the verified cache.
    pub fn verified_len(&self) -> usize {
        self.verified.len()
    }
}

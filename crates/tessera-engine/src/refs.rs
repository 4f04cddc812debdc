//! Per-chunk reference counters.
//!
//! Counters live in the key-value collaborator and change only through
//! `atomic_add`. A counter that reaches zero on decrement is queued as a
//! sweep candidate so the sweeper can reclaim it without waiting for a
//! full scan.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_kv::{KvError, decode_counter};
use tessera_types::ChunkHash;
use tracing::{debug, error, trace};

use crate::error::EngineError;
use crate::keys::{KeySpace, TOMBSTONE};
use crate::kv::BoundedKv;

/// What a reference key currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// No counter exists.
    Absent,
    /// A counter with this value.
    Count(i64),
    /// A sweeper is reclaiming the chunk.
    Reclaiming,
}

/// Reference manager for chunk counters.
pub struct RefManager {
    kv: BoundedKv,
    keys: Arc<KeySpace>,
    candidates: Mutex<Candidates>,
}

#[derive(Default)]
struct Candidates {
    queue: VecDeque<ChunkHash>,
    queued: HashSet<ChunkHash>,
}

impl RefManager {
    /// Create a reference manager over `kv`.
    pub fn new(kv: BoundedKv, keys: Arc<KeySpace>) -> Self {
        Self {
            kv,
            keys,
            candidates: Mutex::new(Candidates::default()),
        }
    }

    /// Take one reference on `hash` and return the new count.
    ///
    /// Fails with [`EngineError::Reclaiming`] if a sweeper holds the key.
    pub async fn increment(&self, hash: &ChunkHash) -> Result<u64, EngineError> {
        let count = self.add(hash, 1).await?;
        trace!(%hash, count, "reference taken");
        Ok(count.max(0) as u64)
    }

    /// Take one reference, waiting out a concurrent reclaim.
    ///
    /// Retries up to `attempts` times, doubling `backoff` after each try.
    pub async fn acquire(
        &self,
        hash: &ChunkHash,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u64, EngineError> {
        let mut delay = backoff;
        let mut tries = 0;
        loop {
            match self.increment(hash).await {
                Err(EngineError::Reclaiming(_)) if tries < attempts => {
                    tries += 1;
                    debug!(%hash, tries, "chunk is being reclaimed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    /// Release one reference on `hash` and return the new count.
    ///
    /// A count that reaches zero becomes a sweep candidate. Releasing a
    /// reference that does not exist is undone and reported as
    /// [`EngineError::RefUnderflow`].
    pub async fn decrement(&self, hash: &ChunkHash) -> Result<u64, EngineError> {
        let count = match self.add(hash, -1).await {
            Ok(count) => count,
            Err(EngineError::Reclaiming(_)) => {
                error!(%hash, "released a reference on a chunk being reclaimed");
                return Err(EngineError::RefUnderflow(*hash));
            }
            Err(e) => return Err(e),
        };

        if count < 0 {
            error!(%hash, count, "reference count underflow");
            self.kv.atomic_add(&self.keys.refs(hash), 1).await?;
            return Err(EngineError::RefUnderflow(*hash));
        }
        if count == 0 {
            self.push_candidate(*hash);
        }
        trace!(%hash, count, "reference released");
        Ok(count as u64)
    }

    /// Apply an arbitrary correction, used by audit.
    pub async fn adjust(&self, hash: &ChunkHash, delta: i64) -> Result<i64, EngineError> {
        let count = self.add(hash, delta).await?;
        if count == 0 {
            self.push_candidate(*hash);
        }
        Ok(count)
    }

    /// Read the current state of a reference key.
    pub async fn state(&self, hash: &ChunkHash) -> Result<RefState, EngineError> {
        let value = self.kv.get(&self.keys.refs(hash)).await?;
        Ok(match value {
            None => RefState::Absent,
            Some(v) if v.as_ref() == TOMBSTONE => RefState::Reclaiming,
            Some(v) => match decode_counter(&v) {
                Some(count) => RefState::Count(count),
                None => {
                    return Err(EngineError::StoreUnavailable(KvError::NotACounter {
                        key: String::from_utf8_lossy(&self.keys.refs(hash)).into_owned(),
                    }));
                }
            },
        })
    }

    /// Current count, treating an absent or reclaiming key as zero.
    pub async fn count(&self, hash: &ChunkHash) -> Result<u64, EngineError> {
        Ok(match self.state(hash).await? {
            RefState::Count(n) => n.max(0) as u64,
            RefState::Absent | RefState::Reclaiming => 0,
        })
    }

    /// Queue a hash for the next sweep.
    pub fn push_candidate(&self, hash: ChunkHash) {
        let mut c = self.candidates.lock().expect("candidates lock poisoned");
        if c.queued.insert(hash) {
            c.queue.push_back(hash);
        }
    }

    /// Take up to `max` queued candidates, oldest first.
    pub fn take_candidates(&self, max: usize) -> Vec<ChunkHash> {
        let mut c = self.candidates.lock().expect("candidates lock poisoned");
        let n = max.min(c.queue.len());
        let taken: Vec<ChunkHash> = c.queue.drain(..n).collect();
        for hash in &taken {
            c.queued.remove(hash);
        }
        taken
    }

    /// Number of queued sweep candidates.
    pub fn candidate_len(&self) -> usize {
        self.candidates
            .lock()
            .expect("candidates lock poisoned")
            .queue
            .len()
    }

    async fn add(&self, hash: &ChunkHash, delta: i64) -> Result<i64, EngineError> {
        match self.kv.atomic_add(&self.keys.refs(hash), delta).await {
            Err(EngineError::StoreUnavailable(KvError::NotACounter { .. })) => {
                Err(EngineError::Reclaiming(*hash))
            }
            other => other,
        }
    }
}

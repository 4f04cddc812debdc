//! Process-local engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals kept by one engine instance.
#[derive(Debug, Default)]
pub struct EngineStats {
    payloads_stored: AtomicU64,
    bytes_in: AtomicU64,
    chunks_new: AtomicU64,
    chunks_reused: AtomicU64,
    reconstructions: AtomicU64,
    bytes_out: AtomicU64,
    discards: AtomicU64,
    chunks_reclaimed: AtomicU64,
    rollbacks: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_store(&self, bytes: u64, new: u64, reused: u64) {
        self.payloads_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_new.fetch_add(new, Ordering::Relaxed);
        self.chunks_reused.fetch_add(reused, Ordering::Relaxed);
    }

    pub(crate) fn record_reconstruct(&self, bytes: u64) {
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self, chunks: u64) {
        self.chunks_reclaimed.fetch_add(chunks, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            payloads_stored: self.payloads_stored.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            chunks_new: self.chunks_new.load(Ordering::Relaxed),
            chunks_reused: self.chunks_reused.load(Ordering::Relaxed),
            reconstructions: self.reconstructions.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            chunks_reclaimed: self.chunks_reclaimed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful store operations.
    pub payloads_stored: u64,
    /// Payload bytes accepted by successful stores.
    pub bytes_in: u64,
    /// Chunk references whose bytes were written for the first time.
    pub chunks_new: u64,
    /// Chunk references satisfied by bytes already stored.
    pub chunks_reused: u64,
    /// Successful reconstructions.
    pub reconstructions: u64,
    /// Payload bytes returned by reconstructions.
    pub bytes_out: u64,
    /// Manifests discarded.
    pub discards: u64,
    /// Chunks deleted by sweeps.
    pub chunks_reclaimed: u64,
    /// Stores that failed and were rolled back.
    pub rollbacks: u64,
}

impl StatsSnapshot {
    /// Fraction of stored chunk references that reused existing bytes.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.chunks_new + self.chunks_reused;
        if total == 0 {
            0.0
        } else {
            self.chunks_reused as f64 / total as f64
        }
    }
}

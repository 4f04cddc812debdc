//! Garbage collection: reclaiming chunks whose reference count is zero.
//!
//! Reclaiming one hash takes four steps, each a single conditional call:
//!
//! 1. `delete_if_equals(ref, 0)`: the counter disappears only if still zero.
//! 2. `set_if_absent(ref, TOMBSTONE, lease)`: fails if an increment
//!    recreated the counter in between, and the chunk is left alone.
//! 3. Delete the chunk, provided less than half the lease has elapsed.
//! 4. `delete_if_equals(ref, TOMBSTONE)`.
//!
//! While the tombstone exists every increment on the hash fails, so no
//! manifest can take a reference to a chunk that is being deleted. A
//! sweeper that dies mid-reclaim leaves a tombstone that expires with its
//! lease; audit then gives any surviving chunk a fresh zero counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tessera_kv::encode_counter;
use tessera_types::{ChunkHash, GcConfig};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, error, info, trace, warn};

use crate::content::ContentStore;
use crate::error::EngineError;
use crate::keys::{KeySpace, TOMBSTONE};
use crate::kv::BoundedKv;
use crate::refs::{RefManager, RefState};
use crate::stats::EngineStats;

/// Outcome of one sweep batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Reference keys examined.
    pub scanned: usize,
    /// Chunks deleted.
    pub reclaimed: usize,
    /// Hashes left alone (live, already gone, or contended).
    pub skipped: usize,
    /// Whether the key scan reached the end and wrapped its cursor.
    pub finished_pass: bool,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.scanned += other.scanned;
        self.reclaimed += other.reclaimed;
        self.skipped += other.skipped;
        self.finished_pass = other.finished_pass;
    }

    fn count(&mut self, outcome: Reclaim) {
        match outcome {
            Reclaim::Reclaimed => self.reclaimed += 1,
            Reclaim::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaim {
    Reclaimed,
    Skipped,
}

/// Reclaims zero-count chunks in bounded batches.
pub struct Sweeper {
    kv: BoundedKv,
    keys: Arc<KeySpace>,
    refs: Arc<RefManager>,
    content: Arc<ContentStore>,
    stats: Arc<EngineStats>,
    lease: Duration,
    /// Last reference key examined by the scan; `None` starts a new pass.
    cursor: Mutex<Option<Vec<u8>>>,
}

impl Sweeper {
    /// Create a sweeper holding each reclaim lease for `lease`.
    pub fn new(
        kv: BoundedKv,
        keys: Arc<KeySpace>,
        refs: Arc<RefManager>,
        content: Arc<ContentStore>,
        stats: Arc<EngineStats>,
        lease: Duration,
    ) -> Self {
        Self {
            kv,
            keys,
            refs,
            content,
            stats,
            lease,
            cursor: Mutex::new(None),
        }
    }

    /// Examine up to `batch` hashes and reclaim those with a zero count.
    ///
    /// Queued candidates go first, then the scan resumes where the last
    /// batch stopped. Concurrent calls on one sweeper are serialized.
    pub async fn sweep(&self, batch: usize) -> Result<SweepReport, EngineError> {
        let mut cursor = self.cursor.lock().await;
        let mut report = SweepReport::default();

        let candidates = self.refs.take_candidates(batch);
        for (i, hash) in candidates.iter().enumerate() {
            report.scanned += 1;
            match self.reclaim(hash).await {
                Ok(outcome) => report.count(outcome),
                Err(e) => {
                    for rest in &candidates[i..] {
                        self.refs.push_candidate(*rest);
                    }
                    self.stats.record_reclaimed(report.reclaimed as u64);
                    return Err(e);
                }
            }
        }

        let budget = batch.saturating_sub(candidates.len());
        if budget > 0 {
            let page = self
                .kv
                .scan_prefix(&self.keys.ref_prefix(), cursor.as_deref(), budget)
                .await?;
            for key in &page.keys {
                let Some(hash) = self.keys.hash_from_key(key) else {
                    warn!(key = %String::from_utf8_lossy(key), "unparseable reference key");
                    continue;
                };
                report.scanned += 1;
                match self.reclaim(&hash).await {
                    Ok(outcome) => report.count(outcome),
                    Err(e) => {
                        self.stats.record_reclaimed(report.reclaimed as u64);
                        return Err(e);
                    }
                }
            }
            report.finished_pass = page.next.is_none();
            *cursor = page.next;
        }

        self.stats.record_reclaimed(report.reclaimed as u64);
        debug!(
            scanned = report.scanned,
            reclaimed = report.reclaimed,
            skipped = report.skipped,
            finished_pass = report.finished_pass,
            "sweep batch done"
        );
        Ok(report)
    }

    /// Sweep batch after batch until the scan wraps.
    pub async fn sweep_all(&self, batch: usize) -> Result<SweepReport, EngineError> {
        let mut total = SweepReport::default();
        loop {
            let report = self.sweep(batch).await?;
            total.absorb(report);
            if report.finished_pass {
                return Ok(total);
            }
        }
    }

    /// Reclaim one hash if its count is exactly zero.
    async fn reclaim(&self, hash: &ChunkHash) -> Result<Reclaim, EngineError> {
        match self.refs.state(hash).await {
            Ok(RefState::Count(0)) => {}
            Ok(RefState::Count(_) | RefState::Absent | RefState::Reclaiming) => {
                return Ok(Reclaim::Skipped);
            }
            Err(EngineError::StoreUnavailable(tessera_kv::KvError::NotACounter { key })) => {
                warn!(%hash, key = %key, "reference key holds an unknown value");
                return Ok(Reclaim::Skipped);
            }
            Err(e) => return Err(e),
        }

        let ref_key = self.keys.refs(hash);
        let zero = encode_counter(0);

        if !self.kv.delete_if_equals(&ref_key, &zero).await? {
            trace!(%hash, "counter changed before reclaim");
            return Ok(Reclaim::Skipped);
        }

        let leased_at = Instant::now();
        let acquired = match self
            .kv
            .set_if_absent(&ref_key, Bytes::from_static(TOMBSTONE), Some(self.lease))
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.restore_zero(hash, &ref_key, zero).await;
                return Err(e);
            }
        };
        if !acquired {
            debug!(%hash, "reference taken during reclaim, keeping chunk");
            return Ok(Reclaim::Skipped);
        }

        if leased_at.elapsed() >= self.lease / 2 {
            warn!(%hash, "reclaim lease too short, releasing");
            self.release_lease(hash, &ref_key, zero).await;
            return Ok(Reclaim::Skipped);
        }
        let removed = self.content.remove(hash).await?;

        if let Err(e) = self.kv.delete_if_equals(&ref_key, TOMBSTONE).await {
            warn!(%hash, error = %e, "failed to clear tombstone, it will expire");
        }

        if removed {
            debug!(%hash, "chunk reclaimed");
            Ok(Reclaim::Reclaimed)
        } else {
            trace!(%hash, "chunk already gone");
            Ok(Reclaim::Skipped)
        }
    }

    /// Give up a tombstone and put the zero counter back.
    async fn release_lease(&self, hash: &ChunkHash, ref_key: &[u8], zero: Bytes) {
        match self.kv.delete_if_equals(ref_key, TOMBSTONE).await {
            Ok(true) => self.restore_zero(hash, ref_key, zero).await,
            Ok(false) => {}
            Err(e) => warn!(%hash, error = %e, "failed to release tombstone, it will expire"),
        }
    }

    async fn restore_zero(&self, hash: &ChunkHash, ref_key: &[u8], zero: Bytes) {
        match self.kv.set_if_absent(ref_key, zero, None).await {
            Ok(_) => self.refs.push_candidate(*hash),
            Err(e) => error!(%hash, error = %e, "failed to restore zero counter"),
        }
    }
}

// ---------------------------------------------------------------------------
// Background scheduler
// ---------------------------------------------------------------------------

/// Runs full sweep passes on a fixed interval.
pub struct GcScheduler {
    sweeper: Arc<Sweeper>,
    interval: Duration,
    batch_size: usize,
    passes: Arc<AtomicU64>,
    reclaimed: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl GcScheduler {
    /// Create a scheduler using the interval and batch size from `config`.
    pub fn new(sweeper: Arc<Sweeper>, config: &GcConfig) -> Self {
        Self {
            sweeper,
            interval: config.interval(),
            batch_size: config.batch_size,
            passes: Arc::new(AtomicU64::new(0)),
            reclaimed: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the scheduler loop. The first pass starts immediately.
    pub fn start(self) -> GcHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let passes = self.passes.clone();
        let reclaimed = self.reclaimed.clone();
        let failures = self.failures.clone();
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        GcHandle {
            shutdown_tx,
            task,
            passes,
            reclaimed,
            failures,
        }
    }

    /// Run until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "gc scheduler started"
        );
        let mut tick = interval(self.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_pass(&shutdown).await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!("gc scheduler stopped");
    }

    /// One full pass, checking for shutdown between batches.
    async fn run_pass(&self, shutdown: &watch::Receiver<bool>) {
        let mut total = SweepReport::default();
        loop {
            if *shutdown.borrow() {
                debug!("gc pass interrupted by shutdown");
                return;
            }
            match self.sweeper.sweep(self.batch_size).await {
                Ok(report) => {
                    total.absorb(report);
                    if report.finished_pass {
                        break;
                    }
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "sweep batch failed, retrying next interval");
                    return;
                }
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.reclaimed
            .fetch_add(total.reclaimed as u64, Ordering::Relaxed);
        info!(
            scanned = total.scanned,
            reclaimed = total.reclaimed,
            skipped = total.skipped,
            "gc pass finished"
        );
    }
}

/// Handle to a running [`GcScheduler`].
pub struct GcHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    passes: Arc<AtomicU64>,
    reclaimed: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl GcHandle {
    /// Completed passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Chunks reclaimed by completed passes.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Batches that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "gc scheduler task failed");
        }
    }
}

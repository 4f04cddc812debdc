//! Reference count audit.
//!
//! Audit recomputes the expected count of every hash from the committed
//! manifests and corrects counters that drifted. It runs alongside live
//! stores and discards without a snapshot by reading in three phases:
//!
//! 1. **A**: holders (intents, manifests, intents again).
//! 2. **B**: every counter.
//! 3. **C**: holders again.
//!
//! A hash is corrected only if the manifests listing it are identical in A
//! and C and no live intent in either phase mentions it. Any store or
//! discard that overlapped B therefore shows up as a difference or as an
//! intent, and its hashes are left for the next audit. A store and discard
//! that both complete between A and C leave no trace in the holders, so
//! each counter is read again right before it is corrected and skipped if
//! it moved since B.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_kv::{KvError, encode_counter};
use tessera_types::{ChunkHash, ManifestId};
use tracing::{debug, info, warn};

use crate::content::ContentStore;
use crate::error::EngineError;
use crate::keys::KeySpace;
use crate::kv::BoundedKv;
use crate::manifests::{IntentKind, ManifestRegistry, now_millis};
use crate::refs::{RefManager, RefState};

/// A counter that disagreed with the manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drift {
    /// The hash whose counter drifted.
    pub hash: ChunkHash,
    /// References held by committed manifests.
    pub expected: u64,
    /// Value of the counter before repair.
    pub actual: i64,
}

/// Result of an audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Manifests read in the first phase.
    pub manifests_scanned: usize,
    /// Intents younger than the abandonment window.
    pub intents_live: usize,
    /// Abandoned intents deleted (or that would be, in a dry run).
    pub intents_reaped: usize,
    /// Distinct hashes considered.
    pub hashes_checked: usize,
    /// Counters below their expected value.
    pub under_counted: usize,
    /// Counters above their expected value.
    pub over_counted: usize,
    /// Hashes left alone because a store or discard touched them mid-audit.
    pub unstable_skipped: usize,
    /// Chunks without any counter that were given a zero counter.
    pub orphan_counters_created: usize,
    /// Hashes held by a manifest whose chunk does not exist.
    pub dangling: Vec<ChunkHash>,
    /// Every drifted counter, repaired unless this was a dry run.
    pub repairs: Vec<Drift>,
    /// Whether repairs were skipped.
    pub dry_run: bool,
}

impl DriftReport {
    /// Whether the audit found nothing to repair or report.
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
            && self.dangling.is_empty()
            && self.orphan_counters_created == 0
            && self.intents_reaped == 0
    }
}

/// Outcome of one counter repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repair {
    Applied,
    /// The counter changed under the audit; nothing was left modified.
    Moved,
}

/// Holders observed in one phase.
#[derive(Default)]
struct Holders {
    /// Per hash: the manifests listing it, with multiplicity.
    by_hash: HashMap<ChunkHash, BTreeMap<ManifestId, u64>>,
    /// Hashes mentioned by live intents.
    in_flight: HashSet<ChunkHash>,
    manifests: usize,
    intents_live: usize,
    intents_reaped: usize,
}

impl Holders {
    fn expected(&self, hash: &ChunkHash) -> u64 {
        self.by_hash
            .get(hash)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }
}

/// Recomputes and repairs reference counts.
pub struct Auditor {
    kv: BoundedKv,
    keys: Arc<KeySpace>,
    refs: Arc<RefManager>,
    content: Arc<ContentStore>,
    registry: Arc<ManifestRegistry>,
    pending_timeout: Duration,
    scan_page: usize,
}

impl Auditor {
    /// Create an auditor treating intents older than `pending_timeout` as
    /// abandoned.
    pub fn new(
        kv: BoundedKv,
        keys: Arc<KeySpace>,
        refs: Arc<RefManager>,
        content: Arc<ContentStore>,
        registry: Arc<ManifestRegistry>,
        pending_timeout: Duration,
        scan_page: usize,
    ) -> Self {
        Self {
            kv,
            keys,
            refs,
            content,
            registry,
            pending_timeout,
            scan_page: scan_page.max(1),
        }
    }

    /// Run an audit, repairing drift unless `dry_run` is set.
    pub async fn run(&self, dry_run: bool) -> Result<DriftReport, EngineError> {
        let before = self.read_holders(!dry_run).await?;
        let counters = self.read_counters().await?;
        let after = self.read_holders(false).await?;

        let mut report = DriftReport {
            manifests_scanned: before.manifests,
            intents_live: before.intents_live,
            intents_reaped: before.intents_reaped,
            dry_run,
            ..DriftReport::default()
        };

        let mut hashes: HashSet<ChunkHash> = counters.keys().copied().collect();
        hashes.extend(before.by_hash.keys().copied());
        hashes.extend(after.by_hash.keys().copied());

        let mut ordered: Vec<ChunkHash> = hashes.into_iter().collect();
        ordered.sort();

        for hash in ordered {
            report.hashes_checked += 1;

            if before.in_flight.contains(&hash)
                || after.in_flight.contains(&hash)
                || before.by_hash.get(&hash) != after.by_hash.get(&hash)
            {
                report.unstable_skipped += 1;
                continue;
            }

            let actual = match counters.get(&hash).copied().unwrap_or(RefState::Absent) {
                RefState::Count(n) => n,
                RefState::Absent => 0,
                RefState::Reclaiming => {
                    report.unstable_skipped += 1;
                    continue;
                }
            };
            let expected = before.expected(&hash);

            if expected > 0 && !self.content.contains(&hash).await? {
                warn!(%hash, expected, "manifest references a missing chunk");
                report.dangling.push(hash);
            }

            if actual == expected as i64 {
                continue;
            }

            if !dry_run {
                match self.repair(&hash, expected, actual).await? {
                    Repair::Applied => {}
                    Repair::Moved => {
                        report.unstable_skipped += 1;
                        continue;
                    }
                }
            }

            if actual < expected as i64 {
                report.under_counted += 1;
            } else {
                report.over_counted += 1;
            }
            warn!(%hash, expected, actual, dry_run, "reference count drift");
            report.repairs.push(Drift {
                hash,
                expected,
                actual,
            });
        }

        report.orphan_counters_created = self
            .adopt_orphans(&counters, &before, &after, dry_run)
            .await?;

        info!(
            manifests = report.manifests_scanned,
            hashes = report.hashes_checked,
            under = report.under_counted,
            over = report.over_counted,
            unstable = report.unstable_skipped,
            dangling = report.dangling.len(),
            orphans = report.orphan_counters_created,
            reaped = report.intents_reaped,
            dry_run,
            "audit finished"
        );
        Ok(report)
    }

    /// Move a counter from `actual` to `expected` by a relative adjustment.
    ///
    /// The counter is read again first: a store and its discard may both
    /// have completed since phase B, leaving the holders unchanged while
    /// the counter moved. An over-count repair that lands below `expected`
    /// raced a release and is undone.
    async fn repair(
        &self,
        hash: &ChunkHash,
        expected: u64,
        actual: i64,
    ) -> Result<Repair, EngineError> {
        let current = match self.refs.state(hash).await? {
            RefState::Count(n) => n,
            RefState::Absent => 0,
            RefState::Reclaiming => return Ok(Repair::Moved),
        };
        if current != actual {
            debug!(%hash, actual, current, "counter moved during audit, leaving for next audit");
            return Ok(Repair::Moved);
        }

        let delta = expected as i64 - actual;
        let repaired = match self.refs.adjust(hash, delta).await {
            Ok(count) => count,
            Err(EngineError::Reclaiming(_)) => {
                debug!(%hash, "reclaim started before repair, leaving for next audit");
                return Ok(Repair::Moved);
            }
            Err(e) => return Err(e),
        };
        if delta < 0 && repaired < expected as i64 {
            warn!(%hash, expected, repaired, "repair raced a release, undoing");
            self.refs.adjust(hash, -delta).await?;
            return Ok(Repair::Moved);
        }
        Ok(Repair::Applied)
    }

    /// Read intents, then manifests, then intents again.
    ///
    /// Intents are read on both sides of the manifest scan so that a store
    /// or discard in progress is seen either as an intent or through the
    /// manifest it commits or removes.
    async fn read_holders(&self, reap: bool) -> Result<Holders, EngineError> {
        let mut holders = Holders::default();
        self.read_intents(&mut holders, true, reap).await?;

        let manifests = self.registry.manifests().await?;
        holders.manifests = manifests.len();
        for manifest in &manifests {
            for hash in manifest.hashes() {
                *holders
                    .by_hash
                    .entry(hash)
                    .or_default()
                    .entry(manifest.id)
                    .or_default() += 1;
            }
        }

        self.read_intents(&mut holders, false, false).await?;
        Ok(holders)
    }

    /// Mark hashes of live intents as in flight.
    ///
    /// With `tally` set, live and abandoned intents are counted; with
    /// `reap` set, abandoned intents are also deleted.
    async fn read_intents(
        &self,
        holders: &mut Holders,
        tally: bool,
        reap: bool,
    ) -> Result<(), EngineError> {
        let now = now_millis();
        let window = self.pending_timeout.as_millis() as u64;

        for stored in self.registry.intents().await? {
            let intent = &stored.intent;
            if intent.age_ms(now) > window {
                if reap {
                    if self.registry.reap_intent(&stored).await? {
                        warn!(
                            id = %intent.manifest,
                            kind = intent.kind.as_str(),
                            hashes = intent.hashes.len(),
                            "reaped abandoned intent"
                        );
                        holders.intents_reaped += 1;
                    }
                } else if tally {
                    holders.intents_reaped += 1;
                }
                continue;
            }

            // A store intent whose manifest is committed only awaits deletion.
            if intent.kind == IntentKind::Store
                && self.registry.load(&intent.manifest).await?.is_some()
            {
                continue;
            }
            if tally {
                holders.intents_live += 1;
            }
            holders.in_flight.extend(intent.hashes.iter().copied());
        }
        Ok(())
    }

    /// Read every counter.
    async fn read_counters(&self) -> Result<HashMap<ChunkHash, RefState>, EngineError> {
        let keys = self
            .kv
            .scan_all(&self.keys.ref_prefix(), self.scan_page)
            .await?;
        let mut counters = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(hash) = self.keys.hash_from_key(&key) else {
                continue;
            };
            match self.refs.state(&hash).await {
                Ok(state) => {
                    counters.insert(hash, state);
                }
                Err(EngineError::StoreUnavailable(KvError::NotACounter { .. })) => {
                    warn!(%hash, "reference key holds an unknown value");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(counters = counters.len(), "read reference counters");
        Ok(counters)
    }

    /// Give chunks that have no counter and no holder a zero counter.
    async fn adopt_orphans(
        &self,
        counters: &HashMap<ChunkHash, RefState>,
        before: &Holders,
        after: &Holders,
        dry_run: bool,
    ) -> Result<usize, EngineError> {
        let chunk_keys = self
            .kv
            .scan_all(&self.keys.chunk_prefix(), self.scan_page)
            .await?;
        let mut adopted = 0;
        for key in chunk_keys {
            let Some(hash) = self.keys.hash_from_key(&key) else {
                continue;
            };
            if counters.contains_key(&hash)
                || before.by_hash.contains_key(&hash)
                || after.by_hash.contains_key(&hash)
                || before.in_flight.contains(&hash)
                || after.in_flight.contains(&hash)
            {
                continue;
            }
            if dry_run {
                adopted += 1;
                continue;
            }
            let zero: Bytes = encode_counter(0);
            if self.kv.set_if_absent(&self.keys.refs(&hash), zero, None).await? {
                debug!(%hash, "orphan chunk given a zero counter");
                self.refs.push_candidate(hash);
                adopted += 1;
            }
        }
        Ok(adopted)
    }
}

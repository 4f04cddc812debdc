//! [`Tessera`]: the engine that ties chunker, content store, reference
//! manager and manifest registry together.

use std::sync::Arc;

use tessera_cas::{CdcChunker, Chunk, build_manifest, validate_layout};
use tessera_kv::KvStore;
use tessera_types::{
    ChunkHash, EngineConfig, MANIFEST_VERSION, Manifest, ManifestId, PayloadChecksum,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{Auditor, DriftReport};
use crate::content::{ContentStore, PutOutcome};
use crate::engine::TesseraEngine;
use crate::error::EngineError;
use crate::gc::{GcScheduler, SweepReport, Sweeper};
use crate::keys::KeySpace;
use crate::kv::BoundedKv;
use crate::manifests::{Intent, IntentKind, ManifestRegistry};
use crate::refs::RefManager;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::txn::StoreTxn;

/// The deduplication engine.
///
/// Shared state lives entirely in the key-value collaborator; any number of
/// `Tessera` instances, in one process or many, can work on the same
/// namespace.
pub struct Tessera {
    config: EngineConfig,
    chunker: CdcChunker,
    keys: Arc<KeySpace>,
    kv: BoundedKv,
    content: Arc<ContentStore>,
    refs: Arc<RefManager>,
    registry: Arc<ManifestRegistry>,
    sweeper: Arc<Sweeper>,
    auditor: Auditor,
    stats: Arc<EngineStats>,
}

impl Tessera {
    /// Build an engine over `kv` after validating `config`.
    pub fn new(config: EngineConfig, kv: Arc<dyn KvStore>) -> Result<Self, EngineError> {
        config.validate()?;

        let chunker = CdcChunker::new(config.chunking)?;
        let keys = Arc::new(KeySpace::new(config.key_prefix.clone()));
        let kv = BoundedKv::new(kv, config.store.op_timeout());
        let page = config.gc.batch_size;

        let content = Arc::new(ContentStore::new(kv.clone(), keys.clone(), &config.store));
        let refs = Arc::new(RefManager::new(kv.clone(), keys.clone()));
        let registry = Arc::new(ManifestRegistry::new(kv.clone(), keys.clone(), page));
        let stats = Arc::new(EngineStats::default());
        let sweeper = Arc::new(Sweeper::new(
            kv.clone(),
            keys.clone(),
            refs.clone(),
            content.clone(),
            stats.clone(),
            config.gc.tombstone_ttl(),
        ));
        let auditor = Auditor::new(
            kv.clone(),
            keys.clone(),
            refs.clone(),
            content.clone(),
            registry.clone(),
            config.gc.pending_timeout(),
            page,
        );

        info!(
            prefix = %config.key_prefix,
            min = config.chunking.min_size,
            avg = config.chunking.avg_size,
            max = config.chunking.max_size,
            window = config.chunking.window_size,
            "engine ready"
        );

        Ok(Self {
            config,
            chunker,
            keys,
            kv,
            content,
            refs,
            registry,
            sweeper,
            auditor,
            stats,
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The key layout under the configured prefix.
    pub fn keys(&self) -> &Arc<KeySpace> {
        &self.keys
    }

    /// The time-bounded collaborator handle.
    pub fn kv(&self) -> &BoundedKv {
        &self.kv
    }

    /// The content store.
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// The reference manager.
    pub fn refs(&self) -> &Arc<RefManager> {
        &self.refs
    }

    /// The manifest registry.
    pub fn registry(&self) -> &Arc<ManifestRegistry> {
        &self.registry
    }

    /// A scheduler that sweeps this engine's namespace in the background.
    pub fn gc_scheduler(&self) -> GcScheduler {
        GcScheduler::new(self.sweeper.clone(), &self.config.gc)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Store a payload: chunk → reference → put → commit manifest.
    pub async fn store(&self, payload: &[u8]) -> Result<Manifest, EngineError> {
        let size = payload.len() as u64;
        if size > self.config.max_payload_size {
            return Err(EngineError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_size,
            });
        }

        let started = Instant::now();
        let deadline = self.config.gc.commit_deadline();
        let id = ManifestId::random();

        let chunks = self.chunker.chunk(payload);
        debug!(%id, size, chunks = chunks.len(), "store: chunked payload");

        let hashes: Vec<ChunkHash> = chunks.iter().map(|c| c.hash).collect();
        let mut txn = StoreTxn::begin(&self.refs, &self.registry, id, hashes).await?;

        let mut new = 0u64;
        let mut reused = 0u64;
        for chunk in &chunks {
            if started.elapsed() > deadline {
                return Err(self.roll_back(txn, deadline_exceeded(deadline)).await);
            }
            match self.store_chunk(chunk, &mut txn).await {
                Ok(true) => new += 1,
                Ok(false) => reused += 1,
                Err(e) => return Err(self.roll_back(txn, e).await),
            }
        }

        let manifest = build_manifest(id, &chunks, payload);
        if started.elapsed() > deadline {
            return Err(self.roll_back(txn, deadline_exceeded(deadline)).await);
        }

        match self.registry.commit(&manifest).await {
            Ok(true) => {}
            Ok(false) => {
                let cause = EngineError::CorruptManifest(format!("manifest id {id} already taken"));
                return Err(self.roll_back(txn, cause).await);
            }
            Err(e) => match self.registry.load(&id).await {
                Ok(Some(committed)) if committed == manifest => {
                    debug!(%id, error = %e, "commit reported failure but manifest is present");
                }
                _ => {
                    self.stats.record_rollback();
                    return Err(txn.abandon(e));
                }
            },
        }
        txn.commit().await;

        self.stats.record_store(size, new, reused);
        info!(
            %id, size,
            chunks = manifest.chunk_count(),
            new, reused,
            "store complete"
        );
        Ok(manifest)
    }

    /// Take a reference on one chunk, then make sure its bytes are stored.
    ///
    /// Returns whether the bytes were written by this call.
    async fn store_chunk(&self, chunk: &Chunk, txn: &mut StoreTxn<'_>) -> Result<bool, EngineError> {
        self.refs
            .acquire(
                &chunk.hash,
                self.config.store.reclaim_retries,
                self.config.store.reclaim_backoff(),
            )
            .await?;
        txn.record(chunk.hash);

        match self.content.put(chunk.hash, chunk.data.clone()).await? {
            PutOutcome::Stored => Ok(true),
            PutOutcome::AlreadyPresentVerified => Ok(false),
            PutOutcome::CollisionDetected { actual } => Err(EngineError::HashCollision {
                hash: chunk.hash,
                actual,
            }),
        }
    }

    async fn roll_back(&self, txn: StoreTxn<'_>, cause: EngineError) -> EngineError {
        self.stats.record_rollback();
        let id = txn.id();
        let err = match txn.rollback(cause).await {
            // Compensated, but corrupt data is surfaced as is and never retried.
            EngineError::PartialStoreRolledBack { source } if source.is_data_error() => *source,
            err => err,
        };
        warn!(%id, error = %err, "store failed");
        err
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Rebuild a payload from its manifest, verifying every byte.
    pub async fn reconstruct(&self, manifest: &Manifest) -> Result<Vec<u8>, EngineError> {
        if manifest.version != MANIFEST_VERSION {
            return Err(EngineError::CorruptManifest(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        validate_layout(manifest).map_err(|e| EngineError::CorruptManifest(e.to_string()))?;
        // No committed payload can exceed the limit, so neither can its manifest.
        if manifest.total_size > self.config.max_payload_size {
            return Err(EngineError::CorruptManifest(format!(
                "manifest declares {} bytes, limit is {}",
                manifest.total_size, self.config.max_payload_size
            )));
        }

        let mut out = Vec::with_capacity(manifest.total_size as usize);
        for (index, chunk) in manifest.chunks.iter().enumerate() {
            let data = self
                .content
                .get(&chunk.hash)
                .await?
                .ok_or(EngineError::ChunkMissing {
                    hash: chunk.hash,
                    index,
                })?;
            if data.len() != chunk.size as usize {
                return Err(EngineError::CorruptManifest(format!(
                    "chunk {index} is {} bytes, manifest lists {}",
                    data.len(),
                    chunk.size
                )));
            }
            out.extend_from_slice(&data);
        }

        if out.len() as u64 != manifest.total_size {
            return Err(EngineError::CorruptManifest(format!(
                "rebuilt {} bytes, manifest lists {}",
                out.len(),
                manifest.total_size
            )));
        }
        if PayloadChecksum::of(&out) != manifest.checksum {
            return Err(EngineError::CorruptManifest(format!(
                "checksum mismatch for manifest {}",
                manifest.id
            )));
        }

        self.stats.record_reconstruct(out.len() as u64);
        debug!(id = %manifest.id, size = out.len(), "reconstruct complete");
        Ok(out)
    }

    /// Load a committed manifest by id.
    pub async fn manifest(&self, id: ManifestId) -> Result<Manifest, EngineError> {
        self.registry
            .load(&id)
            .await?
            .ok_or(EngineError::ManifestNotFound(id))
    }

    // ------------------------------------------------------------------
    // Delete path
    // ------------------------------------------------------------------

    /// Remove a committed manifest and release every reference it holds.
    ///
    /// The references released are those of the committed record, not of
    /// the caller's copy.
    pub async fn discard(&self, id: ManifestId) -> Result<(), EngineError> {
        let started = Instant::now();
        let deadline = self.config.gc.commit_deadline();

        let Some(committed) = self.registry.load(&id).await? else {
            return Err(EngineError::ManifestNotFound(id));
        };
        let intent = Intent::new(IntentKind::Release, id, committed.hashes().collect());
        let raw = self.registry.put_intent(&intent).await?;

        let removed = match self.registry.remove(&id).await {
            Ok(removed) => removed,
            Err(e) => {
                self.drop_release_intent(&id, &raw).await;
                return Err(e);
            }
        };
        let Some(manifest) = removed else {
            // A concurrent discard won.
            self.drop_release_intent(&id, &raw).await;
            return Err(EngineError::ManifestNotFound(id));
        };

        let mut first_error = None;
        for hash in manifest.hashes() {
            if started.elapsed() > deadline {
                first_error.get_or_insert(deadline_exceeded(deadline));
                break;
            }
            match self.refs.decrement(&hash).await {
                Ok(_) => {}
                Err(EngineError::RefUnderflow(_)) => {
                    warn!(%id, %hash, "released a reference that was never counted");
                }
                Err(e) => {
                    warn!(%id, %hash, error = %e, "failed to release reference");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            // The intent stays; audit settles the counts once it is abandoned.
            return Err(e);
        }
        self.drop_release_intent(&id, &raw).await;

        self.stats.record_discard();
        info!(%id, chunks = manifest.chunk_count(), "discard complete");
        Ok(())
    }

    async fn drop_release_intent(&self, id: &ManifestId, raw: &[u8]) {
        if let Err(e) = self
            .registry
            .delete_intent(IntentKind::Release, id, raw)
            .await
        {
            warn!(%id, error = %e, "failed to delete release intent");
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Run one sweep batch of up to `batch` hashes.
    pub async fn sweep(&self, batch: usize) -> Result<SweepReport, EngineError> {
        self.sweeper.sweep(batch).await
    }

    /// Sweep until the scan has covered every reference key once.
    pub async fn sweep_all(&self) -> Result<SweepReport, EngineError> {
        self.sweeper.sweep_all(self.config.gc.batch_size).await
    }

    /// Recompute reference counts, repairing drift unless `dry_run`.
    pub async fn audit(&self, dry_run: bool) -> Result<DriftReport, EngineError> {
        self.auditor.run(dry_run).await
    }

    /// Running totals.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn deadline_exceeded(deadline: std::time::Duration) -> EngineError {
    EngineError::Timeout {
        op: "store",
        after: deadline,
    }
}

#[async_trait::async_trait]
impl TesseraEngine for Tessera {
    async fn store(&self, payload: &[u8]) -> Result<Manifest, EngineError> {
        Tessera::store(self, payload).await
    }

    async fn reconstruct(&self, manifest: &Manifest) -> Result<Vec<u8>, EngineError> {
        Tessera::reconstruct(self, manifest).await
    }

    async fn discard(&self, manifest: &Manifest) -> Result<(), EngineError> {
        Tessera::discard(self, manifest.id).await
    }

    async fn manifest(&self, id: ManifestId) -> Result<Manifest, EngineError> {
        Tessera::manifest(self, id).await
    }

    async fn sweep(&self, batch: usize) -> Result<usize, EngineError> {
        Ok(Tessera::sweep(self, batch).await?.reclaimed)
    }

    async fn audit(&self) -> Result<DriftReport, EngineError> {
        Tessera::audit(self, false).await
    }

    async fn audit_dry_run(&self) -> Result<DriftReport, EngineError> {
        Tessera::audit(self, true).await
    }

    fn stats(&self) -> StatsSnapshot {
        Tessera::stats(self)
    }
}

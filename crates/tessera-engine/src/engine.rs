//! [`TesseraEngine`]: the interface the payload layer depends on.
//!
//! Producers, workers and admin tooling call the engine through this trait
//! rather than the concrete [`Tessera`](crate::Tessera) struct, so a caller
//! can swap in a different backend or a test double.

use tessera_types::{Manifest, ManifestId};

use crate::audit::DriftReport;
use crate::error::EngineError;
use crate::stats::StatsSnapshot;

/// Deduplicating payload store.
///
/// - **store**: payload in, manifest out
/// - **reconstruct**: manifest in, payload out
/// - **discard**: drop a manifest and release its references
/// - **sweep** / **audit**: garbage collection and count repair
#[async_trait::async_trait]
pub trait TesseraEngine: Send + Sync {
    /// Deduplicate and store a payload.
    ///
    /// Either the returned manifest is committed with one reference per
    /// listed chunk, or nothing is committed and an error is returned.
    async fn store(&self, payload: &[u8]) -> Result<Manifest, EngineError>;

    /// Rebuild the exact bytes a manifest describes.
    ///
    /// Never returns partial output.
    async fn reconstruct(&self, manifest: &Manifest) -> Result<Vec<u8>, EngineError>;

    /// Make a manifest unreachable and release its references.
    async fn discard(&self, manifest: &Manifest) -> Result<(), EngineError>;

    /// Load a committed manifest.
    async fn manifest(&self, id: ManifestId) -> Result<Manifest, EngineError>;

    /// Examine up to `batch` hashes and return how many chunks were reclaimed.
    async fn sweep(&self, batch: usize) -> Result<usize, EngineError>;

    /// Recompute reference counts and repair drift.
    async fn audit(&self) -> Result<DriftReport, EngineError>;

    /// Recompute reference counts without changing anything.
    async fn audit_dry_run(&self) -> Result<DriftReport, EngineError>;

    /// Running totals for this engine instance.
    fn stats(&self) -> StatsSnapshot;
}

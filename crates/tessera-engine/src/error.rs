//! Error types for the engine.

use std::time::Duration;

use tessera_kv::KvError;
use tessera_types::{ChunkHash, ConfigError, ManifestId};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Stored chunk bytes do not hash to their address.
    ///
    /// Reads fail closed: the bytes are never returned to the caller.
    #[error("integrity mismatch for chunk {hash}: bytes hash to {actual}")]
    IntegrityMismatch {
        /// The address that was requested.
        hash: ChunkHash,
        /// The hash of the bytes actually found.
        actual: ChunkHash,
    },

    /// A chunk listed by a manifest does not exist.
    #[error("chunk {hash} at index {index} is missing")]
    ChunkMissing {
        /// The missing chunk.
        hash: ChunkHash,
        /// Its position in the manifest.
        index: usize,
    },

    /// A manifest is malformed or does not reproduce its payload.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// The key-value collaborator rejected or failed a request.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] KvError),

    /// A key-value call or a store operation ran out of time.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        op: &'static str,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// A store failed midway and every reference it took was released.
    #[error("store rolled back: {source}")]
    PartialStoreRolledBack {
        /// The failure that triggered the rollback.
        #[source]
        source: Box<EngineError>,
    },

    /// A store failed and releasing its references failed too.
    ///
    /// The store intent is kept so the next audit repairs the counters.
    #[error("store failed ({source}); {pending} references left for audit")]
    RollbackIncomplete {
        /// The failure that triggered the rollback.
        #[source]
        source: Box<EngineError>,
        /// References that could not be released.
        pending: usize,
    },

    /// An existing chunk entry holds different bytes than its address implies.
    #[error("hash collision on chunk {hash}: stored bytes hash to {actual}")]
    HashCollision {
        /// The address being stored.
        hash: ChunkHash,
        /// The hash of the bytes already stored there.
        actual: ChunkHash,
    },

    /// The chunk is being reclaimed by a sweeper.
    #[error("chunk {0} is being reclaimed")]
    Reclaiming(ChunkHash),

    /// A reference count would have dropped below zero.
    #[error("reference count underflow for chunk {0}")]
    RefUnderflow(ChunkHash),

    /// No committed manifest has this id.
    #[error("manifest not found: {0}")]
    ManifestNotFound(ManifestId),

    /// The payload exceeds the configured size limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// Chunking or manifest encoding error.
    #[error("cas error: {0}")]
    Cas(#[from] tessera_cas::CasError),

    /// Invalid engine configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether the caller may safely retry the operation unchanged.
    ///
    /// A rolled-back store left no trace, so it can be retried too.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::Timeout { .. }
                | Self::PartialStoreRolledBack { .. }
                | Self::Reclaiming(_)
        )
    }

    /// Whether the error reports corrupted or missing data.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::IntegrityMismatch { .. }
                | Self::ChunkMissing { .. }
                | Self::CorruptManifest(_)
                | Self::HashCollision { .. }
        )
    }
}

//! Error types for chunking and manifest encoding.

use tessera_types::ConfigError;

/// Errors that can occur during CAS operations.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred during streaming.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest has an unsupported version.
    #[error("unsupported manifest version {found}, this build supports version {supported}")]
    UnsupportedVersion {
        /// Version found in the manifest.
        found: u8,
        /// Version this build supports.
        supported: u8,
    },

    /// Chunk references do not tile the payload.
    #[error("invalid manifest layout: {0}")]
    InvalidLayout(String),

    /// Chunker parameters failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

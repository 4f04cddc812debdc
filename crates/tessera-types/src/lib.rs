//! Shared types and identifiers for Tessera.
//!
//! This crate defines the core types used across the Tessera workspace:
//! identifiers ([`ChunkHash`], [`ManifestId`], [`PayloadChecksum`]),
//! the [`Manifest`] describing a deduplicated payload, and the
//! configuration structs in [`config`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod config;

pub use config::{
    ChunkerConfig, ConfigError, EngineConfig, GcConfig, StoreConfig, VerifyPolicy,
};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex32(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Content address of a chunk: `blake3(chunk_data)`.
    ChunkHash
);

define_id!(
    /// Identifier of a stored manifest, random per store operation.
    ManifestId
);

define_id!(
    /// SHA-256 of a complete payload, independent of chunk hashes.
    PayloadChecksum
);

impl ChunkHash {
    /// Hash chunk bytes with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }
}

impl ManifestId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl PayloadChecksum {
    /// Compute the SHA-256 checksum of a payload.
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }
}

/// Error returned when parsing a hex-encoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    /// The string is not exactly 64 hex characters.
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),

    /// The string contains a non-hex character.
    #[error("invalid hex character {0:?}")]
    InvalidChar(char),
}

fn parse_hex32(s: &str) -> Result<[u8; 32], ParseIdError> {
    if s.len() != 64 {
        return Err(ParseIdError::Length(s.len()));
    }
    let mut out = [0u8; 32];
    let mut chars = s.chars();
    for byte in out.iter_mut() {
        let mut value = 0u8;
        for _ in 0..2 {
            let c = chars.next().ok_or(ParseIdError::Length(s.len()))?;
            let nibble = c.to_digit(16).ok_or(ParseIdError::InvalidChar(c))?;
            value = (value << 4) | nibble as u8;
        }
        *byte = value;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Current manifest format version.
pub const MANIFEST_VERSION: u8 = 1;

/// Ordered list of chunk references describing one stored payload.
///
/// Storing the same payload twice produces two manifests with distinct ids
/// and identical chunk lists; each one holds its own references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version, checked on deserialization.
    pub version: u8,
    /// Unique identifier of this manifest.
    pub id: ManifestId,
    /// Length of the original payload in bytes.
    pub total_size: u64,
    /// Chunk references in payload order.
    pub chunks: Vec<ChunkRef>,
    /// SHA-256 of the original payload.
    pub checksum: PayloadChecksum,
    /// Unix timestamp (seconds) when the payload was stored.
    pub created_at: u64,
}

impl Manifest {
    /// Number of chunk references (counting repeats).
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether this manifest describes an empty payload.
    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Iterate the chunk hashes in payload order, with repeats.
    pub fn hashes(&self) -> impl Iterator<Item = ChunkHash> + '_ {
        self.chunks.iter().map(|c| c.hash)
    }
}

/// A single chunk reference inside a [`Manifest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content address of the chunk.
    pub hash: ChunkHash,
    /// Byte offset of the chunk within the payload.
    pub offset: u64,
    /// Size of the chunk in bytes.
    pub size: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

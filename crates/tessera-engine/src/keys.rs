//! Key layout inside the key-value collaborator.
//!
//! Every key starts with the caller's namespace prefix:
//!
//! - `{ns}chunk/{hash}`: chunk bytes, with TTL
//! - `{ns}ref/{hash}`: reference counter, or [`TOMBSTONE`] while reclaiming
//! - `{ns}manifest/{id}`: postcard manifest
//! - `{ns}intent/{kind}/{id}`: postcard intent

use tessera_types::{ChunkHash, ManifestId};

/// Value held by a reference key while its chunk is being reclaimed.
///
/// Not 8 bytes wide, so increments on it fail instead of resurrecting
/// the counter.
pub const TOMBSTONE: &[u8] = b"reclaiming";

/// Builds and parses namespaced keys.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space under the given namespace prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of a chunk's bytes.
    pub fn chunk(&self, hash: &ChunkHash) -> Vec<u8> {
        format!("{}chunk/{hash}", self.prefix).into_bytes()
    }

    /// Prefix of all chunk keys.
    pub fn chunk_prefix(&self) -> Vec<u8> {
        format!("{}chunk/", self.prefix).into_bytes()
    }

    /// Key of a chunk's reference counter.
    pub fn refs(&self, hash: &ChunkHash) -> Vec<u8> {
        format!("{}ref/{hash}", self.prefix).into_bytes()
    }

    /// Prefix of all reference keys.
    pub fn ref_prefix(&self) -> Vec<u8> {
        format!("{}ref/", self.prefix).into_bytes()
    }

    /// Key of a committed manifest.
    pub fn manifest(&self, id: &ManifestId) -> Vec<u8> {
        format!("{}manifest/{id}", self.prefix).into_bytes()
    }

    /// Prefix of all manifest keys.
    pub fn manifest_prefix(&self) -> Vec<u8> {
        format!("{}manifest/", self.prefix).into_bytes()
    }

    /// Key of an intent record.
    pub fn intent(&self, kind: &str, id: &ManifestId) -> Vec<u8> {
        format!("{}intent/{kind}/{id}", self.prefix).into_bytes()
    }

    /// Prefix of all intent keys.
    pub fn intent_prefix(&self) -> Vec<u8> {
        format!("{}intent/", self.prefix).into_bytes()
    }

    /// Parse the hash out of a chunk or reference key.
    pub fn hash_from_key(&self, key: &[u8]) -> Option<ChunkHash> {
        last_segment(key)?.parse().ok()
    }

    /// Parse the manifest id out of a manifest or intent key.
    pub fn id_from_key(&self, key: &[u8]) -> Option<ManifestId> {
        last_segment(key)?.parse().ok()
    }
}

fn last_segment(key: &[u8]) -> Option<&str> {
    let key = std::str::from_utf8(key).ok()?;
    key.rsplit('/').next()
}

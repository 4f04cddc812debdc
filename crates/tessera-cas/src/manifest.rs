//! Manifest building, layout validation and serialization.

use tessera_types::{ChunkRef, MANIFEST_VERSION, Manifest, ManifestId, PayloadChecksum};

use crate::chunker::Chunk;
use crate::error::CasError;

/// Build a [`Manifest`] for `payload` from its chunks.
pub fn build_manifest(id: ManifestId, chunks: &[Chunk], payload: &[u8]) -> Manifest {
    build_manifest_with_timestamp(id, chunks, payload, now_secs())
}

/// Build a manifest with an explicit timestamp (for deterministic testing).
pub fn build_manifest_with_timestamp(
    id: ManifestId,
    chunks: &[Chunk],
    payload: &[u8],
    created_at: u64,
) -> Manifest {
    Manifest {
        version: MANIFEST_VERSION,
        id,
        total_size: payload.len() as u64,
        chunks: chunks
            .iter()
            .map(|c| ChunkRef {
                hash: c.hash,
                offset: c.offset,
                size: c.data.len() as u32,
            })
            .collect(),
        checksum: PayloadChecksum::of(payload),
        created_at,
    }
}

/// Check that the chunk references tile `[0, total_size)` with no gaps.
pub fn validate_layout(manifest: &Manifest) -> Result<(), CasError> {
    let mut expected_offset = 0u64;
    for (index, chunk) in manifest.chunks.iter().enumerate() {
        if chunk.offset != expected_offset {
            return Err(CasError::InvalidLayout(format!(
                "chunk {index} starts at {} but previous chunk ends at {expected_offset}",
                chunk.offset
            )));
        }
        if chunk.size == 0 {
            return Err(CasError::InvalidLayout(format!("chunk {index} is empty")));
        }
        expected_offset += u64::from(chunk.size);
    }
    if expected_offset != manifest.total_size {
        return Err(CasError::InvalidLayout(format!(
            "chunks cover {expected_offset} bytes, manifest declares {}",
            manifest.total_size
        )));
    }
    Ok(())
}

/// Serialize a manifest to postcard bytes.
pub fn serialize_manifest(manifest: &Manifest) -> Result<Vec<u8>, CasError> {
    postcard::to_allocvec(manifest).map_err(|e| CasError::Serialization(e.to_string()))
}

/// Deserialize a manifest from postcard bytes.
///
/// Rejects manifests with unknown version numbers.
pub fn deserialize_manifest(bytes: &[u8]) -> Result<Manifest, CasError> {
    let manifest: Manifest =
        postcard::from_bytes(bytes).map_err(|e| CasError::Serialization(e.to_string()))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(CasError::UnsupportedVersion {
            found: manifest.version,
            supported: MANIFEST_VERSION,
        });
    }
    Ok(manifest)
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

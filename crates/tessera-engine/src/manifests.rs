//! Committed manifests and the intent records that guard reference changes.
//!
//! A store writes a [`IntentKind::Store`] intent before taking any
//! reference and deletes it after the manifest is committed. A discard
//! writes a [`IntentKind::Release`] intent before removing the manifest and
//! deletes it after every reference is released. Audit counts live intents
//! as reference holders, so a crash at any point leaves counts it can
//! reconcile.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_cas::{deserialize_manifest, serialize_manifest};
use tessera_types::{ChunkHash, Manifest, ManifestId};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::keys::KeySpace;
use crate::kv::BoundedKv;

/// Which side of a reference change an intent guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntentKind {
    /// References are about to be taken for a new manifest.
    Store,
    /// References of a removed manifest are about to be released.
    Release,
}

impl IntentKind {
    /// Key segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Release => "release",
        }
    }
}

/// Durable record of references about to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Store or release.
    pub kind: IntentKind,
    /// The manifest whose references change.
    pub manifest: ManifestId,
    /// Hashes involved, with repeats.
    pub hashes: Vec<ChunkHash>,
    /// Unix time in milliseconds when the intent was written.
    pub created_at_ms: u64,
}

impl Intent {
    /// Create an intent stamped with the current time.
    pub fn new(kind: IntentKind, manifest: ManifestId, hashes: Vec<ChunkHash>) -> Self {
        Self {
            kind,
            manifest,
            hashes,
            created_at_ms: now_millis(),
        }
    }

    /// Age relative to `now_ms`, zero if the clock went backwards.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// An intent as found by a scan, with the raw value needed to delete it.
#[derive(Debug, Clone)]
pub struct StoredIntent {
    /// Key the intent lives under.
    pub key: Vec<u8>,
    /// Encoded value, for conditional deletion.
    pub raw: Bytes,
    /// Decoded intent.
    pub intent: Intent,
}

/// Reads and writes manifests and intents in the key-value collaborator.
pub struct ManifestRegistry {
    kv: BoundedKv,
    keys: Arc<KeySpace>,
    scan_page: usize,
}

impl ManifestRegistry {
    /// Create a registry that scans `scan_page` keys at a time.
    pub fn new(kv: BoundedKv, keys: Arc<KeySpace>, scan_page: usize) -> Self {
        Self {
            kv,
            keys,
            scan_page: scan_page.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Manifests
    // ------------------------------------------------------------------

    /// Commit a manifest. Returns `false` if its id is already taken.
    pub async fn commit(&self, manifest: &Manifest) -> Result<bool, EngineError> {
        let bytes = serialize_manifest(manifest)?;
        let created = self
            .kv
            .set_if_absent(&self.keys.manifest(&manifest.id), Bytes::from(bytes), None)
            .await?;
        debug!(id = %manifest.id, created, "manifest commit");
        Ok(created)
    }

    /// Load a committed manifest.
    pub async fn load(&self, id: &ManifestId) -> Result<Option<Manifest>, EngineError> {
        match self.kv.get(&self.keys.manifest(id)).await? {
            Some(bytes) => Ok(Some(decode_manifest(id, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a committed manifest, returning it if this call removed it.
    pub async fn remove(&self, id: &ManifestId) -> Result<Option<Manifest>, EngineError> {
        let key = self.keys.manifest(id);
        let Some(bytes) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let manifest = decode_manifest(id, &bytes)?;
        if self.kv.delete_if_equals(&key, &bytes).await? {
            Ok(Some(manifest))
        } else {
            Ok(None)
        }
    }

    /// Ids of every committed manifest.
    pub async fn manifest_ids(&self) -> Result<Vec<ManifestId>, EngineError> {
        let keys = self
            .kv
            .scan_all(&self.keys.manifest_prefix(), self.scan_page)
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.keys.id_from_key(k))
            .collect())
    }

    /// Every committed manifest. Manifests removed during the scan are skipped.
    pub async fn manifests(&self) -> Result<Vec<Manifest>, EngineError> {
        let mut out = Vec::new();
        for id in self.manifest_ids().await? {
            if let Some(manifest) = self.load(&id).await? {
                out.push(manifest);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    /// Write an intent and return its encoded value.
    ///
    /// An existing intent under the same key is left untouched.
    pub async fn put_intent(&self, intent: &Intent) -> Result<Bytes, EngineError> {
        let raw = Bytes::from(encode_intent(intent)?);
        let key = self.keys.intent(intent.kind.as_str(), &intent.manifest);
        if !self.kv.set_if_absent(&key, raw.clone(), None).await? {
            warn!(id = %intent.manifest, kind = intent.kind.as_str(), "intent already present");
        }
        Ok(raw)
    }

    /// Delete an intent if it still holds `raw`.
    pub async fn delete_intent(
        &self,
        kind: IntentKind,
        id: &ManifestId,
        raw: &[u8],
    ) -> Result<bool, EngineError> {
        self.kv
            .delete_if_equals(&self.keys.intent(kind.as_str(), id), raw)
            .await
    }

    /// Delete a scanned intent if it is unchanged.
    pub async fn reap_intent(&self, stored: &StoredIntent) -> Result<bool, EngineError> {
        self.kv.delete_if_equals(&stored.key, &stored.raw).await
    }

    /// Every intent currently recorded. Undecodable intents are skipped.
    pub async fn intents(&self) -> Result<Vec<StoredIntent>, EngineError> {
        let keys = self
            .kv
            .scan_all(&self.keys.intent_prefix(), self.scan_page)
            .await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            match postcard::from_bytes::<Intent>(&raw) {
                Ok(intent) => out.push(StoredIntent { key, raw, intent }),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "skipping undecodable intent"
                ),
            }
        }
        Ok(out)
    }
}

fn decode_manifest(id: &ManifestId, bytes: &[u8]) -> Result<Manifest, EngineError> {
    let manifest = deserialize_manifest(bytes)
        .map_err(|e| EngineError::CorruptManifest(format!("manifest {id}: {e}")))?;
    if manifest.id != *id {
        return Err(EngineError::CorruptManifest(format!(
            "manifest stored under {id} carries id {}",
            manifest.id
        )));
    }
    Ok(manifest)
}

fn encode_intent(intent: &Intent) -> Result<Vec<u8>, EngineError> {
    postcard::to_allocvec(intent)
        .map_err(|e| EngineError::Cas(tessera_cas::CasError::Serialization(e.to_string())))
}

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

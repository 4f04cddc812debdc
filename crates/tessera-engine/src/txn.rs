//! Compensating transaction for the store path.
//!
//! A [`StoreTxn`] owns the store intent and remembers every reference it
//! took. On failure it releases them in reverse order and removes the
//! intent, so a failed store leaves the counters as it found them.

use bytes::Bytes;
use tessera_types::{ChunkHash, ManifestId};
use tracing::{debug, error, warn};

use crate::error::EngineError;
use crate::manifests::{Intent, IntentKind, ManifestRegistry};
use crate::refs::RefManager;

/// References taken so far by one store operation.
pub struct StoreTxn<'a> {
    refs: &'a RefManager,
    registry: &'a ManifestRegistry,
    id: ManifestId,
    intent: Bytes,
    taken: Vec<ChunkHash>,
}

impl<'a> StoreTxn<'a> {
    /// Record the store intent and open the transaction.
    pub async fn begin(
        refs: &'a RefManager,
        registry: &'a ManifestRegistry,
        id: ManifestId,
        hashes: Vec<ChunkHash>,
    ) -> Result<Self, EngineError> {
        let capacity = hashes.len();
        let intent = registry
            .put_intent(&Intent::new(IntentKind::Store, id, hashes))
            .await?;
        Ok(Self {
            refs,
            registry,
            id,
            intent,
            taken: Vec::with_capacity(capacity),
        })
    }

    /// The manifest this transaction stores.
    pub fn id(&self) -> ManifestId {
        self.id
    }

    /// Note that a reference on `hash` was taken.
    pub fn record(&mut self, hash: ChunkHash) {
        self.taken.push(hash);
    }

    /// Number of references taken so far.
    pub fn taken(&self) -> usize {
        self.taken.len()
    }

    /// The manifest is committed; drop the intent.
    ///
    /// A failed delete is only logged: an intent whose manifest exists
    /// holds no extra references and audit reaps it.
    pub async fn commit(self) {
        match self
            .registry
            .delete_intent(IntentKind::Store, &self.id, &self.intent)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(id = %self.id, "store intent already gone at commit"),
            Err(e) => warn!(id = %self.id, error = %e, "failed to delete store intent"),
        }
    }

    /// Give up without undoing anything, when the commit outcome is unknown.
    ///
    /// The intent stays so audit settles the counts once it is abandoned.
    pub fn abandon(self, cause: EngineError) -> EngineError {
        error!(id = %self.id, taken = self.taken.len(), error = %cause, "store outcome unknown, leaving intent");
        EngineError::RollbackIncomplete {
            source: Box::new(cause),
            pending: self.taken.len(),
        }
    }

    /// Undo every reference taken and turn `cause` into the store's error.
    pub async fn rollback(self, cause: EngineError) -> EngineError {
        debug!(id = %self.id, taken = self.taken.len(), error = %cause, "rolling back store");

        let mut pending = 0usize;
        for hash in self.taken.iter().rev() {
            if let Err(e) = self.refs.decrement(hash).await {
                error!(id = %self.id, %hash, error = %e, "failed to release reference during rollback");
                pending += 1;
            }
        }

        if pending == 0 {
            match self
                .registry
                .delete_intent(IntentKind::Store, &self.id, &self.intent)
                .await
            {
                Ok(_) => {
                    return EngineError::PartialStoreRolledBack {
                        source: Box::new(cause),
                    };
                }
                Err(e) => {
                    error!(id = %self.id, error = %e, "failed to delete store intent after rollback");
                }
            }
        }

        EngineError::RollbackIncomplete {
            source: Box::new(cause),
            pending,
        }
    }
}

//! Time-bounded access to the key-value collaborator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_kv::{KvError, KvStore, ScanPage};

use crate::error::EngineError;

/// Wraps a [`KvStore`] so that every call is bounded by a timeout.
///
/// Failures are surfaced, never retried here.
#[derive(Clone)]
pub struct BoundedKv {
    inner: Arc<dyn KvStore>,
    timeout: Duration,
}

impl BoundedKv {
    /// Wrap a store with the given per-call timeout.
    pub fn new(inner: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn KvStore> {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, KvError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }

    pub async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, EngineError> {
        self.bounded("set_if_absent", self.inner.set_if_absent(key, value, ttl))
            .await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, EngineError> {
        self.bounded("get", self.inner.get(key)).await
    }

    pub async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64, EngineError> {
        self.bounded("atomic_add", self.inner.atomic_add(key, delta))
            .await
    }

    pub async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool, EngineError> {
        self.bounded(
            "delete_if_equals",
            self.inner.delete_if_equals(key, expected),
        )
        .await
    }

    pub async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool, EngineError> {
        self.bounded("refresh_ttl", self.inner.refresh_ttl(key, ttl))
            .await
    }

    pub async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage, EngineError> {
        self.bounded("scan_prefix", self.inner.scan_prefix(prefix, after, limit))
            .await
    }

    /// Collect every key under `prefix`, paging `page` keys at a time.
    pub async fn scan_all(&self, prefix: &[u8], page: usize) -> Result<Vec<Vec<u8>>, EngineError> {
        let mut keys = Vec::new();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let batch = self.scan_prefix(prefix, cursor.as_deref(), page).await?;
            keys.extend(batch.keys);
            match batch.next {
                Some(next) => cursor = Some(next),
                None => return Ok(keys),
            }
        }
    }
}

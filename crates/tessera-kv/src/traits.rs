//! The key-value collaborator contract.

use std::time::Duration;

use bytes::Bytes;

use crate::error::KvError;

/// Width of an encoded counter value.
pub const COUNTER_LEN: usize = 8;

/// Encode a counter as 8 big-endian bytes.
pub fn encode_counter(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decode a counter, or `None` if the value is not 8 bytes wide.
pub fn decode_counter(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; COUNTER_LEN] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Matching keys in ascending byte order.
    pub keys: Vec<Vec<u8>>,
    /// Cursor for the next page, `None` once the prefix is exhausted.
    pub next: Option<Vec<u8>>,
}

/// Durable key-value store with per-key atomic primitives.
///
/// Every operation is atomic with respect to other operations on the same
/// key. Nothing is promised across keys. Expired entries behave exactly as
/// if they were absent.
///
/// Counters are 8-byte big-endian `i64` values; any other value width is
/// not a counter and makes [`atomic_add`](Self::atomic_add) fail.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key` unless the key already exists.
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Read the value at `key`.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, KvError>;

    /// Add `delta` to the counter at `key` and return the new value.
    ///
    /// A missing key counts as zero. The key's TTL, if any, is preserved.
    async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64, KvError>;

    /// Delete `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool, KvError>;

    /// Reset the TTL of an existing key. Returns `false` if it is absent.
    async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool, KvError>;

    /// List keys starting with `prefix`, strictly after `after`, up to `limit`.
    async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage, KvError>;

    /// `atomic_add(key, 1)`.
    async fn atomic_increment(&self, key: &[u8]) -> Result<i64, KvError> {
        self.atomic_add(key, 1).await
    }

    /// `atomic_add(key, -1)`.
    async fn atomic_decrement(&self, key: &[u8]) -> Result<i64, KvError> {
        self.atomic_add(key, -1).await
    }
}

/// Build the page returned by a scan that collected `keys` with `limit`.
pub(crate) fn finish_page(keys: Vec<Vec<u8>>, limit: usize) -> ScanPage {
    let next = if keys.len() == limit {
        keys.last().cloned()
    } else {
        None
    };
    ScanPage { keys, next }
}

//! Persistent key-value backend on Fjall.
//!
//! Every value is stored in an envelope: 8 bytes of big-endian expiry time
//! (Unix milliseconds, `0` for no expiry) followed by the payload. Reads
//! treat expired envelopes as absent; writes that find one overwrite it.
//!
//! Fjall has no compare-and-swap, so read-modify-write primitives are
//! serialized by a process-wide write lock. A single `FjallKv` must own the
//! database directory.

use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tempfile::TempDir;
use tracing::{debug, trace};

use crate::error::KvError;
use crate::traits::{KvStore, ScanPage, decode_counter, encode_counter, finish_page};

type Result<T> = std::result::Result<T, KvError>;

const HEADER_LEN: usize = 8;

/// Key-value store backed by a single Fjall keyspace.
pub struct FjallKv {
    #[allow(dead_code)]
    db: Database,
    entries: Keyspace,
    write_lock: Mutex<()>,
    /// Keeps the directory of a temporary store alive.
    _tmp: Option<TempDir>,
}

impl FjallKv {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path.as_ref()).open()?;
        debug!(path = %path.as_ref().display(), "opened fjall key-value store");
        Self::init(db, None)
    }

    /// Open a temporary store that is removed on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init(db, Some(tmp))
    }

    fn init(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let entries = db.keyspace("entries", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            entries,
            write_lock: Mutex::new(()),
            _tmp: tmp,
        })
    }

    /// Read the live payload at `key`, if any.
    fn read_live(&self, key: &[u8], now: u64) -> Result<Option<(u64, Bytes)>> {
        match self.entries.get(key)? {
            Some(raw) => {
                let (expires_at, payload) = open_envelope(key, &raw)?;
                if is_live(expires_at, now) {
                    Ok(Some((expires_at, Bytes::copy_from_slice(payload))))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn write(&self, key: &[u8], expires_at: u64, payload: &[u8]) -> Result<()> {
        let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
        raw.extend_from_slice(&expires_at.to_be_bytes());
        raw.extend_from_slice(payload);
        self.entries.insert(key, raw.as_slice())?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KvStore for FjallKv {
    async fn set_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let now = now_millis();
        if self.read_live(key, now)?.is_some() {
            return Ok(false);
        }
        trace!(key = %String::from_utf8_lossy(key), size = value.len(), "set");
        self.write(key, deadline(now, ttl), &value)?;
        Ok(true)
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.read_live(key, now_millis())?.map(|(_, v)| v))
    }

    async fn atomic_add(&self, key: &[u8], delta: i64) -> Result<i64> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let (expires_at, current) = match self.read_live(key, now_millis())? {
            Some((expires_at, value)) => (
                expires_at,
                decode_counter(&value).ok_or_else(|| KvError::not_a_counter(key))?,
            ),
            None => (0, 0),
        };
        let updated = current.wrapping_add(delta);
        self.write(key, expires_at, &encode_counter(updated))?;
        Ok(updated)
    }

    async fn delete_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        match self.read_live(key, now_millis())? {
            Some((_, value)) if value.as_ref() == expected => {
                self.entries.remove(key)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_ttl(&self, key: &[u8], ttl: Duration) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let now = now_millis();
        match self.read_live(key, now)? {
            Some((_, value)) => {
                self.write(key, deadline(now, Some(ttl)), &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage> {
        let now = now_millis();
        // Resume strictly after the cursor instead of re-walking the prefix.
        let start = match after {
            Some(cursor) if cursor >= prefix => Bound::Excluded(cursor.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let mut keys = Vec::new();
        for guard in self.entries.range((start, Bound::Unbounded)) {
            if keys.len() == limit {
                break;
            }
            // Expiry lives in the value envelope, so the value is read too.
            let (key, raw) = guard.into_inner()?;
            if !key.starts_with(prefix) {
                break;
            }
            let (expires_at, _) = open_envelope(&key, &raw)?;
            if is_live(expires_at, now) {
                keys.push(key.to_vec());
            }
        }
        Ok(finish_page(keys, limit))
    }
}

fn open_envelope<'a>(key: &[u8], raw: &'a [u8]) -> Result<(u64, &'a [u8])> {
    if raw.len() < HEADER_LEN {
        return Err(KvError::CorruptEnvelope {
            key: String::from_utf8_lossy(key).into_owned(),
        });
    }
    let (header, payload) = raw.split_at(HEADER_LEN);
    let mut arr = [0u8; HEADER_LEN];
    arr.copy_from_slice(header);
    Ok((u64::from_be_bytes(arr), payload))
}

fn is_live(expires_at: u64, now: u64) -> bool {
    expires_at == 0 || expires_at > now
}

fn deadline(now: u64, ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) => now.saturating_add(ttl.as_millis() as u64).max(1),
        None => 0,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! Key-value collaborator trait and backend implementations.
//!
//! This crate defines the [`KvStore`] trait: the six per-key atomic
//! primitives the deduplication engine relies on for all shared state. It
//! ships three backends:
//!
//! - [`MemoryKv`] - in-memory storage backed by a `RwLock<BTreeMap>`.
//! - [`FjallKv`] - persistent storage on a Fjall keyspace.
//! - [`ChaosKv`] - a wrapper that injects latency and failures.

mod chaos_kv;
mod error;
mod fjall_kv;
mod memory_kv;
mod traits;

pub use chaos_kv::ChaosKv;
pub use error::KvError;
pub use fjall_kv::FjallKv;
pub use memory_kv::MemoryKv;
pub use traits::{COUNTER_LEN, KvStore, ScanPage, decode_counter, encode_counter};

//! Deduplicating payload engine.
//!
//! The [`Tessera`] engine splits payloads into content-defined chunks,
//! stores each chunk once under its BLAKE3 hash, and returns a
//! [`Manifest`](tessera_types::Manifest) listing the chunks. Reference
//! counts kept in the key-value collaborator decide when the [`Sweeper`]
//! may reclaim a chunk; the [`Auditor`] repairs counts that drifted.
//!
//! Callers depend on the [`TesseraEngine`] trait rather than the concrete
//! struct.

pub mod audit;
pub mod cache;
pub mod content;
pub mod engine;
pub mod error;
pub mod gc;
pub mod keys;
pub mod kv;
pub mod manifests;
pub mod refs;
pub mod stats;
pub mod tessera;
pub mod txn;

pub use audit::{Auditor, Drift, DriftReport};
pub use cache::VerifiedSet;
pub use content::{ContentStore, PutOutcome};
pub use engine::TesseraEngine;
pub use error::EngineError;
pub use gc::{GcHandle, GcScheduler, SweepReport, Sweeper};
pub use keys::{KeySpace, TOMBSTONE};
pub use kv::BoundedKv;
pub use manifests::{Intent, IntentKind, ManifestRegistry, StoredIntent};
pub use refs::{RefManager, RefState};
pub use stats::{EngineStats, StatsSnapshot};
pub use tessera::Tessera;
pub use txn::StoreTxn;

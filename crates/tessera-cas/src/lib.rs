//! Content addressing, chunking, and manifest encoding.
//!
//! This crate provides:
//! - [`CdcChunker`] - splits payloads into content-defined chunks, each
//!   identified by its BLAKE3 hash.
//! - [`RollingHash`] - the sliding-window hash that places chunk boundaries.
//! - [`build_manifest`] - constructs a [`Manifest`](tessera_types::Manifest)
//!   from chunks and the original payload.
//! - [`serialize_manifest`] / [`deserialize_manifest`] - postcard encoding
//!   with a format version check.

mod chunker;
mod error;
mod manifest;
mod rolling;

pub use chunker::{CdcChunker, Chunk};
pub use error::CasError;
pub use manifest::{
    build_manifest, build_manifest_with_timestamp, deserialize_manifest, now_secs,
    serialize_manifest, validate_layout,
};
pub use rolling::RollingHash;

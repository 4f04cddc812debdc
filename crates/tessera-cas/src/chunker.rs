//! Content-defined chunking over a rolling hash.
//!
//! A boundary is declared after byte `i` when the current chunk is at least
//! `min_size` long and the rolling hash of the trailing window is divisible
//! by `avg_size - min_size`, so the expected chunk length is close to
//! `avg_size`. A boundary is forced at `max_size`. The hash restarts at every
//! chunk start, which keeps boundaries local: an edit only moves the
//! boundaries of the chunks around it.

use bytes::Bytes;
use tessera_types::{ChunkHash, ChunkerConfig};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CasError;
use crate::rolling::RollingHash;

/// A single chunk of payload data with its content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Content address: `blake3(data)`.
    pub hash: ChunkHash,
    /// Byte offset within the original payload.
    pub offset: u64,
    /// The raw chunk data.
    pub data: Bytes,
}

/// Deterministic content-defined chunker.
#[derive(Debug, Clone)]
pub struct CdcChunker {
    config: ChunkerConfig,
    divisor: u64,
}

impl CdcChunker {
    /// Build a chunker from validated parameters.
    pub fn new(config: ChunkerConfig) -> Result<Self, CasError> {
        config.validate()?;
        let divisor = u64::from(config.avg_size - config.min_size).max(1);
        Ok(Self { config, divisor })
    }

    /// Chunker with explicit sizes and the default window (for testing).
    pub fn with_sizes(min_size: u32, avg_size: u32, max_size: u32) -> Result<Self, CasError> {
        Self::new(ChunkerConfig {
            min_size,
            avg_size,
            max_size,
            ..ChunkerConfig::default()
        })
    }

    /// The parameters this chunker was built with.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split a payload into content-defined chunks.
    ///
    /// Returns an empty vec for empty input and a single chunk for input no
    /// longer than `min_size`.
    pub fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        self.chunk_bytes(Bytes::copy_from_slice(data))
    }

    /// Same as [`chunk`](Self::chunk) but slices an owned buffer without copying.
    pub fn chunk_bytes(&self, data: Bytes) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut hasher = RollingHash::new(self.config.window_size as usize);
        let mut start = 0usize;

        while start < data.len() {
            let len = self.next_boundary(&data[start..], &mut hasher);
            let slice = data.slice(start..start + len);
            chunks.push(Chunk {
                hash: ChunkHash::from_data(&slice),
                offset: start as u64,
                data: slice,
            });
            start += len;
        }

        chunks
    }

    /// Read a stream to the end and chunk it.
    pub async fn chunk_stream(
        &self,
        mut reader: impl AsyncRead + Unpin,
    ) -> Result<Vec<Chunk>, CasError> {
        // Boundaries depend only on content, so buffering the whole
        // stream yields the same chunks as `chunk`.
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(self.chunk_bytes(Bytes::from(buf)))
    }

    /// Length of the chunk starting at `data[0]`.
    fn next_boundary(&self, data: &[u8], hasher: &mut RollingHash) -> usize {
        let min = self.config.min_size as usize;
        let max = self.config.max_size as usize;

        if data.len() <= min {
            return data.len();
        }
        let end = data.len().min(max);

        // Only the trailing window before `min` can influence the first
        // eligible boundary check.
        hasher.reset();
        let warmup = min.saturating_sub(hasher.window_len());
        for &byte in &data[warmup..min - 1] {
            hasher.roll(byte);
        }

        for (i, &byte) in data.iter().enumerate().take(end).skip(min - 1) {
            if hasher.roll(byte) % self.divisor == 0 {
                return i + 1;
            }
        }
        end
    }
}

impl Default for CdcChunker {
    fn default() -> Self {
        let config = ChunkerConfig::default();
        Self {
            divisor: u64::from(config.avg_size - config.min_size),
            config,
        }
    }
}

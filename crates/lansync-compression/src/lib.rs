//! Per-chunk compression for LanSync transfers
//!
//! Files travel as a sequence of fixed-size chunks, each compressed on its
//! own so a receiver can decompress and hash them in arrival order.
//!
//! # Examples
//!
//! ```rust
//! use lansync_compression::ChunkCodec;
//!
//! let codec = ChunkCodec::for_level(6, 64 * 1024);
//! let packed = codec.compress_chunk(b"hello hello hello").unwrap();
//! assert_eq!(codec.decompress_chunk(&packed).unwrap(), b"hello hello hello");
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod algorithms;

pub use algorithms::{Algorithm, AlgorithmImpl, CompressionAlgorithm, NoCompression, ZlibAlgorithm};

use lansync_types::Result;
use std::fmt;

/// Compresses and restores transfer chunks
pub struct ChunkCodec {
    algorithm: Box<dyn Algorithm + Send + Sync>,
    level: u32,
    chunk_size: usize,
}

impl ChunkCodec {
    /// Codec for an explicit algorithm
    pub fn new(algorithm: CompressionAlgorithm, level: u32, chunk_size: usize) -> Self {
        Self {
            algorithm: AlgorithmImpl::create(algorithm),
            level,
            chunk_size,
        }
    }

    /// zlib at `level`, or pass-through when `level` is 0
    pub fn for_level(level: u32, chunk_size: usize) -> Self {
        let algorithm = if level == 0 {
            CompressionAlgorithm::None
        } else {
            CompressionAlgorithm::Zlib
        };
        Self::new(algorithm, level, chunk_size)
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm.algorithm_type()
    }

    /// Uncompressed bytes per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Compress one chunk
    pub fn compress_chunk(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.algorithm.compress(data, self.level)
    }

    /// Restore one chunk; output is capped at the chunk size
    pub fn decompress_chunk(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.algorithm.decompress(data, self.chunk_size)
    }
}

impl fmt::Debug for ChunkCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCodec")
            .field("algorithm", &self.algorithm())
            .field("level", &self.level)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

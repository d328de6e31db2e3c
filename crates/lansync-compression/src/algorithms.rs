//! Compression algorithm implementations
//!
//! Each transfer chunk is compressed on its own, so every algorithm here
//! works on complete in-memory buffers.

use lansync_types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// Chunk compression advertised in a file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Chunks are sent verbatim
    None,
    /// zlib (deflate with header and adler32 trailer)
    #[default]
    Zlib,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Zlib => f.write_str("zlib"),
        }
    }
}

/// Trait for compression algorithm implementations
pub trait Algorithm {
    /// Compress data with the specified level
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>>;

    /// Decompress data, refusing output larger than `limit` bytes
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>>;

    /// Get the algorithm type
    fn algorithm_type(&self) -> CompressionAlgorithm;

    /// Get the default compression level
    fn default_level(&self) -> u32;

    /// Get the maximum compression level
    fn max_level(&self) -> u32;
}

/// Algorithm implementation factory
pub struct AlgorithmImpl;

impl AlgorithmImpl {
    /// Create an algorithm implementation for the specified type
    pub fn create(algorithm: CompressionAlgorithm) -> Box<dyn Algorithm + Send + Sync> {
        match algorithm {
            CompressionAlgorithm::None => Box::new(NoCompression),
            CompressionAlgorithm::Zlib => Box::new(ZlibAlgorithm),
        }
    }
}

/// No compression implementation
#[derive(Debug, Clone)]
pub struct NoCompression;

impl Algorithm for NoCompression {
    fn compress(&self, data: &[u8], _level: u32) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        if data.len() > limit {
            return Err(Error::compression(format!(
                "Chunk of {} bytes exceeds limit of {}",
                data.len(),
                limit
            )));
        }
        Ok(data.to_vec())
    }

    fn algorithm_type(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn default_level(&self) -> u32 {
        0
    }

    fn max_level(&self) -> u32 {
        0
    }
}

/// zlib compression implementation
#[derive(Debug, Clone)]
pub struct ZlibAlgorithm;

impl Algorithm for ZlibAlgorithm {
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>> {
        let level = flate2::Compression::new(level.min(self.max_level()));
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
        encoder
            .write_all(data)
            .map_err(|e| Error::compression(format!("zlib compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| Error::compression(format!("zlib compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let decoder = flate2::read::ZlibDecoder::new(data);
        let mut output = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut output)
            .map_err(|e| Error::compression(format!("zlib decompression failed: {}", e)))?;

        if output.len() > limit {
            return Err(Error::compression(format!(
                "Decompressed chunk exceeds limit of {} bytes",
                limit
            )));
        }
        Ok(output)
    }

    fn algorithm_type(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zlib
    }

    fn default_level(&self) -> u32 {
        6
    }

    fn max_level(&self) -> u32 {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CompressionAlgorithm::None)]
    #[case(CompressionAlgorithm::Zlib)]
    fn test_roundtrip(#[case] algorithm: CompressionAlgorithm) {
        let algo = AlgorithmImpl::create(algorithm);
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(100);

        let compressed = algo.compress(&data, algo.default_level()).unwrap();
        let restored = algo.decompress(&compressed, data.len()).unwrap();

        assert_eq!(restored, data);
        assert_eq!(algo.algorithm_type(), algorithm);
    }

    #[test]
    fn test_zlib_shrinks_repetitive_data() {
        let data = vec![b'a'; 64 * 1024];
        let compressed = ZlibAlgorithm.compress(&data, 6).unwrap();
        assert!(compressed.len() < data.len() / 10);
    }

    #[test]
    fn test_zlib_level_is_clamped() {
        let data = vec![7u8; 1024];
        let compressed = ZlibAlgorithm.compress(&data, 42).unwrap();
        assert_eq!(ZlibAlgorithm.decompress(&compressed, 1024).unwrap(), data);
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let result = ZlibAlgorithm.decompress(b"definitely not zlib", 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_decompress_limit() {
        let data = vec![0u8; 10_000];
        let compressed = ZlibAlgorithm.compress(&data, 6).unwrap();
        assert!(ZlibAlgorithm.decompress(&compressed, 9_999).is_err());
        assert!(NoCompression.decompress(&data, 9_999).is_err());
    }
}

//! Streaming content hashing
//!
//! The same digest is used for manifest entries and for verifying received
//! files, so a file hashed here and a file assembled chunk by chunk through
//! [`ContentHasher`] compare equal when their bytes are equal.

use lansync_types::{ContentHash, Error, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read buffer used while hashing
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental hasher fed with consecutive slices of one file
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl ContentHasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Digest of everything fed so far
    pub fn finalize(&self) -> ContentHash {
        ContentHash::from(self.inner.finalize())
    }
}

/// Hash a file with a fixed 64 KiB read buffer
pub async fn hash_file(path: impl AsRef<Path>) -> Result<ContentHash> {
    let path = path.as_ref();
    let mut file = File::open(path).await.map_err(|e| map_open_error(path, e))?;

    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await.map_err(|e| Error::Io {
            message: format!("Failed to read '{}': {}", path.display(), e),
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

fn map_open_error(path: &Path, error: std::io::Error) -> Error {
    match error.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => Error::Io {
            message: format!("Failed to open '{}': {}", path.display(), error),
        },
    }
}

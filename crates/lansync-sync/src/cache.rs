//! Hash reuse between rescans
//!
//! A digest is taken from here instead of re-reading the file only when the
//! path's [`FileStamp`] is unchanged since it was hashed. The stamp includes
//! the inode change time, which every write moves and which cannot be set
//! back from user space, so a same-size rewrite with its mtime restored is
//! still detected.

use lansync_types::ContentHash;
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Entries whose change time lies this close to the hashing time are not
/// trusted; coarse filesystem clocks could hide a write in the same tick.
pub const RACY_WINDOW_NS: i64 = 100_000_000;

/// Inode identity and status change time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeToken {
    /// Inode number
    pub inode: u64,
    /// Status change time in nanoseconds since the Unix epoch
    pub changed_ns: i64,
}

/// Metadata a cached digest is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,
    /// Modification time (ms)
    pub modified_at: i64,
    /// `None` where the platform exposes no change time; such files are
    /// always rehashed
    pub change: Option<ChangeToken>,
}

impl FileStamp {
    /// Stamp from filesystem metadata
    pub fn from_metadata(size: u64, modified_at: i64, metadata: &Metadata) -> Self {
        Self {
            size,
            modified_at,
            change: change_token(metadata),
        }
    }
}

#[cfg(unix)]
fn change_token(metadata: &Metadata) -> Option<ChangeToken> {
    use std::os::unix::fs::MetadataExt;
    Some(ChangeToken {
        inode: metadata.ino(),
        changed_ns: metadata
            .ctime()
            .saturating_mul(1_000_000_000)
            .saturating_add(metadata.ctime_nsec()),
    })
}

#[cfg(not(unix))]
fn change_token(_metadata: &Metadata) -> Option<ChangeToken> {
    None
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
}

/// Cached digest for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Metadata at hashing time
    pub stamp: FileStamp,
    /// When the digest was computed, nanoseconds since the Unix epoch
    pub hashed_at_ns: i64,
    /// Digest
    pub hash: ContentHash,
}

impl CacheEntry {
    /// Check if this cache entry is still valid for the given file metadata
    pub fn is_valid(&self, stamp: &FileStamp) -> bool {
        if self.stamp != *stamp {
            return false;
        }
        match stamp.change {
            Some(change) => change.changed_ns.saturating_add(RACY_WINDOW_NS) < self.hashed_at_ns,
            None => false,
        }
    }
}

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that required hashing
    pub misses: u64,
    /// Entries currently held
    pub entries: usize,
}

/// In-memory [`FileStamp`] validated digest cache
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl HashCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest for `path` if its metadata is unchanged
    pub fn get(&mut self, path: &str, stamp: &FileStamp) -> Option<ContentHash> {
        match self.entries.get(path) {
            Some(entry) if entry.is_valid(stamp) => {
                self.hits += 1;
                Some(entry.hash)
            }
            Some(_) => {
                debug!("Cache entry outdated for: {}", path);
                self.entries.remove(path);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Remember a digest computed from a file that carried `stamp` before it
    /// was read
    pub fn store(&mut self, path: impl Into<String>, stamp: FileStamp, hash: ContentHash) {
        self.entries.insert(
            path.into(),
            CacheEntry {
                stamp,
                hashed_at_ns: now_ns(),
                hash,
            },
        );
    }

    /// Drop entries for paths that no longer exist
    pub fn retain_paths(&mut self, live: &HashSet<String>) {
        self.entries.retain(|path, _| live.contains(path));
    }

    /// Clear all cache entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

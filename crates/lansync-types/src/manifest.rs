//! Content digests, file entries and manifests
//!
//! A [`Manifest`] is a snapshot of one node's sync root keyed by relative
//! path. Entries are compared by [`ContentHash`]; the modification time is
//! only ever used to break conflicts.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// Length of a content digest in bytes
pub const HASH_LEN: usize = 32;

/// 256-bit content digest.
///
/// Ordering is byte-lexicographic, which matches ordering of the lowercase
/// hex form used on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        Self::from(blake3::hash(data))
    }

    /// Digest of the empty input, used for directory entries
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// Raw digest bytes
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::protocol(format!("Invalid content hash '{}': {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One file (or, when directory tracking is on, one directory) in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the sync root, `/` separated
    pub relative_path: String,
    /// Digest of the file content
    pub content_hash: ContentHash,
    /// Size in bytes
    pub size_bytes: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_at: i64,
    /// Directory marker
    #[serde(default)]
    pub is_directory: bool,
}

impl FileEntry {
    /// Create a regular file entry
    pub fn new(
        relative_path: impl Into<String>,
        content_hash: ContentHash,
        size_bytes: u64,
        modified_at: i64,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_hash,
            size_bytes,
            modified_at,
            is_directory: false,
        }
    }

    /// Create a directory entry
    pub fn directory(relative_path: impl Into<String>, modified_at: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_hash: ContentHash::empty(),
            size_bytes: 0,
            modified_at,
            is_directory: true,
        }
    }

    /// Same path and same content; `modified_at` is ignored
    pub fn is_identical(&self, other: &FileEntry) -> bool {
        self.relative_path == other.relative_path && self.content_hash == other.content_hash
    }
}

/// Snapshot of a sync root, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, FileEntry>,
}

impl Manifest {
    /// Create an empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same path
    pub fn insert(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(entry.relative_path.clone(), entry)
    }

    /// Remove the entry for `path`
    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    /// Look up an entry
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    /// Whether `path` is present
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of entries, directories included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of regular file entries
    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_directory).count()
    }

    /// Sum of all file sizes
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Iterate over entries in path order
    pub fn iter(&self) -> btree_map::Values<'_, String, FileEntry> {
        self.entries.values()
    }

    /// Iterate over paths in order
    pub fn paths(&self) -> btree_map::Keys<'_, String, FileEntry> {
        self.entries.keys()
    }
}

impl FromIterator<FileEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for entry in iter {
            manifest.insert(entry);
        }
        manifest
    }
}

impl IntoIterator for Manifest {
    type Item = FileEntry;
    type IntoIter = btree_map::IntoValues<String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a FileEntry;
    type IntoIter = btree_map::Values<'a, String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = ContentHash::of(b"hello world");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_hash_rejects_bad_hex() {
        assert!(ContentHash::from_hex("zz").is_err());
        assert!(ContentHash::from_hex(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn test_hash_ordering_matches_hex() {
        let low = ContentHash::from_bytes([0x01; HASH_LEN]);
        let high = ContentHash::from_bytes([0xf0; HASH_LEN]);
        assert!(high > low);
        assert!(high.to_hex() > low.to_hex());
    }

    #[test]
    fn test_hash_serializes_as_hex_string() {
        let hash = ContentHash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_identical_ignores_mtime() {
        let hash = ContentHash::of(b"same");
        let a = FileEntry::new("a.txt", hash, 4, 1_000);
        let b = FileEntry::new("a.txt", hash, 4, 9_000);
        let c = FileEntry::new("b.txt", hash, 4, 1_000);

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
    }

    #[test]
    fn test_manifest_keys_are_unique() {
        let mut manifest = Manifest::new();
        manifest.insert(FileEntry::new("a", ContentHash::of(b"1"), 1, 0));
        let previous = manifest.insert(FileEntry::new("a", ContentHash::of(b"2"), 1, 0));

        assert!(previous.is_some());
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("a").unwrap().content_hash, ContentHash::of(b"2"));
    }

    #[test]
    fn test_manifest_counts() {
        let manifest: Manifest = vec![
            FileEntry::new("a", ContentHash::of(b"1"), 10, 0),
            FileEntry::new("b", ContentHash::of(b"2"), 5, 0),
            FileEntry::directory("dir", 0),
        ]
        .into_iter()
        .collect();

        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.file_count(), 2);
        assert_eq!(manifest.total_bytes(), 15);
    }

    #[test]
    fn test_manifest_json_is_a_path_map() {
        let manifest: Manifest = vec![FileEntry::new("docs/a.md", ContentHash::of(b"1"), 1, 7)]
            .into_iter()
            .collect();

        let value = serde_json::to_value(&manifest).unwrap();
        assert!(value.get("docs/a.md").is_some());
        assert_eq!(value["docs/a.md"]["modified_at"], 7);

        let back: Manifest = serde_json::from_value(value).unwrap();
        assert_eq!(back, manifest);
    }
}

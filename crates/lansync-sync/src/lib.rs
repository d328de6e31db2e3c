//! Content hashing, manifests and delta calculation for LanSync
//!
//! This crate holds the storage-side half of a sync:
//!
//! - **Content hashing**: streaming 256-bit digests with a fixed 64 KiB buffer
//! - **Manifest building**: recursive scan with dotfile skipping and exclude globs
//! - **Fast rescans**: optional `(size, mtime)` keyed digest reuse
//! - **Delta calculation**: pure comparison of two manifests under a conflict policy
//!
//! # Examples
//!
//! ```rust
//! use lansync_sync::compute_delta;
//! use lansync_types::{ConflictPolicy, ContentHash, FileEntry, Manifest};
//!
//! let local = Manifest::new();
//! let remote: Manifest = vec![FileEntry::new("a.txt", ContentHash::of(b"a"), 1, 0)]
//!     .into_iter()
//!     .collect();
//!
//! let delta = compute_delta(&local, &remote, ConflictPolicy::NewestWins);
//! assert_eq!(delta.download_paths(), vec!["a.txt"]);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod delta;
pub mod hasher;
pub mod manifest;

pub use cache::{CacheEntry, CacheStats, ChangeToken, FileStamp, HashCache};
pub use delta::{
    compute_delta, conflict_path, numbered_path, Conflict, Delta, DeltaCalculator, Download,
};
pub use hasher::{hash_file, ContentHasher, HASH_BUFFER_SIZE};
pub use manifest::{
    relative_path_of, resolve_relative, set_modified_millis, system_time_to_millis,
    LocalManifest, ManifestBuilder, ManifestOptions,
};

//! Core type system and error handling for LanSync
//!
//! This crate provides the data model shared by every LanSync component:
//!
//! - **Error handling**: [`Error`] with kinds, severity levels and retry hints
//! - **Manifests**: [`ContentHash`], [`FileEntry`] and [`Manifest`]
//! - **Peers**: [`Peer`] records and their discovery [`PeerState`]
//! - **Transfers**: [`TransferTask`], [`SyncStats`] and [`ConflictPolicy`]
//!
//! # Examples
//!
//! ```rust
//! use lansync_types::{ContentHash, FileEntry, Manifest};
//!
//! let mut manifest = Manifest::new();
//! manifest.insert(FileEntry::new("notes.txt", ContentHash::of(b"hi"), 2, 0));
//! assert_eq!(manifest.file_count(), 1);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod manifest;
pub mod peer;
pub mod result;
pub mod transfer;

pub use error::{Error, ErrorKind, ErrorSeverity};
pub use manifest::{ContentHash, FileEntry, Manifest, HASH_LEN};
pub use peer::{Peer, PeerId, PeerState, PROTOCOL_VERSION};
pub use result::Result;
pub use transfer::{
    ConflictPolicy, SyncStats, TaskId, TransferDirection, TransferState, TransferTask,
};

//! Discovery, wire protocol and transfer sessions for LanSync
//!
//! This crate moves data between nodes:
//!
//! - **Discovery**: multicast announces, heartbeats and a peer directory with liveness tracking
//! - **Wire codec**: JSON envelopes over magic-prefixed, length-delimited frames
//! - **Transfer sessions**: manifest exchange, delta, and verified chunked file pulls
//! - **Transfer server**: the responder side, one task per connection
//!
//! # Examples
//!
//! ```rust
//! use lansync_network::{Envelope, Message, PeerInfo};
//!
//! let announce = Message::Announce(PeerInfo::new("desk", 42421, vec!["default".into()]));
//! let envelope = Envelope::seal("node-a", &announce).unwrap();
//! let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
//! assert_eq!(decoded.open().unwrap(), announce);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod protocol;
pub mod server;
pub mod session;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use connection::Connection;
pub use discovery::{DirectoryUpdate, DiscoverySocket, PeerDirectory, ReapEvent, DEDUP_WINDOW};
pub use protocol::{
    AckStatus, DeltaSummary, Envelope, FileAck, FileChunk, FileComplete, FileError, FileHeader,
    FileRequest, HeartbeatInfo, ManifestPayload, Message, MessageType, PeerInfo,
};
pub use server::{serve_connection, ServerContext, ServerStats, ServerStatsSnapshot, TransferServer};
pub use session::{SessionConfig, SessionReport, SessionState, SyncSession};

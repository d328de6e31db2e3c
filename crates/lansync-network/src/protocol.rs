//! Wire protocol: envelopes and typed message payloads
//!
//! Every message travels as an [`Envelope`] serialized to JSON:
//! `{"type", "sender", "payload", "timestamp", "msg_id"}`. The payload is
//! decoded into a [`Message`] variant by matching on the envelope type.

use chrono::Utc;
use lansync_compression::CompressionAlgorithm;
use lansync_types::{ContentHash, Error, Manifest, PeerId, Result, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Closed set of envelope types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Periodic multicast presence
    Announce,
    /// Unicast reply to a first announce
    AnnounceAck,
    /// Liveness refresh
    Heartbeat,
    /// Orderly departure
    Goodbye,
    /// Initiator's manifest
    SyncRequest,
    /// Responder's manifest
    SyncManifest,
    /// Initiator's delta summary
    SyncDelta,
    /// Ask for one file
    FileRequest,
    /// File metadata before chunks
    FileHeader,
    /// Announces the next raw chunk frame
    FileChunk,
    /// All chunks sent
    FileComplete,
    /// Receiver committed the file
    FileAck,
    /// Responder cannot serve the file
    FileError,
}

impl MessageType {
    /// Carried on the UDP discovery channel
    pub fn is_discovery(self) -> bool {
        matches!(
            self,
            Self::Announce | Self::AnnounceAck | Self::Heartbeat | Self::Goodbye
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(value.as_str().unwrap_or("UNKNOWN"))
    }
}

/// Presence information carried by announce and ack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Human readable name
    pub display_name: String,
    /// TCP port of the transfer listener
    pub transfer_port: u16,
    /// Protocol version
    pub protocol_version: u32,
    /// Logical roots offered
    #[serde(default)]
    pub shared_folders: Vec<String>,
}

impl PeerInfo {
    /// Presence info for this build's protocol version
    pub fn new(display_name: impl Into<String>, transfer_port: u16, shared_folders: Vec<String>) -> Self {
        Self {
            display_name: display_name.into(),
            transfer_port,
            protocol_version: PROTOCOL_VERSION,
            shared_folders,
        }
    }
}

/// Liveness beacon; everything else about the peer came with its announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    /// TCP port of the transfer listener
    pub transfer_port: u16,
}

/// Manifest carried by `SYNC_REQUEST` and `SYNC_MANIFEST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPayload {
    /// Full manifest, inline
    pub manifest: Manifest,
}

/// Informational delta summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    /// Paths the initiator will request
    pub download: Vec<String>,
    /// Paths the responder should pull
    pub upload: Vec<String>,
    /// Paths left for manual resolution
    pub conflicts: Vec<String>,
}

/// `FILE_REQUEST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Relative path
    pub path: String,
}

/// `FILE_HEADER`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Relative path
    pub path: String,
    /// Uncompressed size
    pub size: u64,
    /// Digest of the full content
    pub hash: ContentHash,
    /// Modification time in epoch milliseconds
    pub modified_at: i64,
    /// Per-chunk compression
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    /// Uncompressed bytes per chunk
    pub chunk_size: u32,
}

/// `FILE_CHUNK` control message; the raw frame follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Relative path
    pub path: String,
    /// Zero-based chunk index
    pub index: u64,
    /// Length of the following raw frame
    pub compressed_size: u32,
}

/// `FILE_COMPLETE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComplete {
    /// Relative path
    pub path: String,
    /// Number of chunks sent
    pub chunks: u64,
}

/// Acknowledgement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Verified and committed
    Ok,
}

/// `FILE_ACK`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAck {
    /// Relative path
    pub path: String,
    /// Outcome
    pub status: AckStatus,
}

/// `FILE_ERROR`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Relative path
    pub path: String,
    /// Why the file cannot be served
    pub message: String,
}

/// Empty payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `ANNOUNCE`
    Announce(PeerInfo),
    /// `ANNOUNCE_ACK`
    AnnounceAck(PeerInfo),
    /// `HEARTBEAT`
    Heartbeat(HeartbeatInfo),
    /// `GOODBYE`
    Goodbye,
    /// `SYNC_REQUEST`
    SyncRequest(ManifestPayload),
    /// `SYNC_MANIFEST`
    SyncManifest(ManifestPayload),
    /// `SYNC_DELTA`
    SyncDelta(DeltaSummary),
    /// `FILE_REQUEST`
    FileRequest(FileRequest),
    /// `FILE_HEADER`
    FileHeader(FileHeader),
    /// `FILE_CHUNK`
    FileChunk(FileChunk),
    /// `FILE_COMPLETE`
    FileComplete(FileComplete),
    /// `FILE_ACK`
    FileAck(FileAck),
    /// `FILE_ERROR`
    FileError(FileError),
}

impl Message {
    /// Envelope type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Announce(_) => MessageType::Announce,
            Self::AnnounceAck(_) => MessageType::AnnounceAck,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Goodbye => MessageType::Goodbye,
            Self::SyncRequest(_) => MessageType::SyncRequest,
            Self::SyncManifest(_) => MessageType::SyncManifest,
            Self::SyncDelta(_) => MessageType::SyncDelta,
            Self::FileRequest(_) => MessageType::FileRequest,
            Self::FileHeader(_) => MessageType::FileHeader,
            Self::FileChunk(_) => MessageType::FileChunk,
            Self::FileComplete(_) => MessageType::FileComplete,
            Self::FileAck(_) => MessageType::FileAck,
            Self::FileError(_) => MessageType::FileError,
        }
    }

    fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Announce(p) | Self::AnnounceAck(p) => serde_json::to_value(p),
            Self::Heartbeat(p) => serde_json::to_value(p),
            Self::Goodbye => serde_json::to_value(Empty {}),
            Self::SyncRequest(p) | Self::SyncManifest(p) => serde_json::to_value(p),
            Self::SyncDelta(p) => serde_json::to_value(p),
            Self::FileRequest(p) => serde_json::to_value(p),
            Self::FileHeader(p) => serde_json::to_value(p),
            Self::FileChunk(p) => serde_json::to_value(p),
            Self::FileComplete(p) => serde_json::to_value(p),
            Self::FileAck(p) => serde_json::to_value(p),
            Self::FileError(p) => serde_json::to_value(p),
        };
        value.map_err(|e| {
            Error::protocol(format!(
                "Failed to encode {} payload: {}",
                self.message_type(),
                e
            ))
        })
    }
}

/// Immutable message wrapper exchanged between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender node id
    pub sender: PeerId,
    /// Type-specific body
    pub payload: serde_json::Value,
    /// Send time in epoch milliseconds
    pub timestamp: i64,
    /// Dedup key derived from sender and send time
    pub msg_id: String,
}

impl Envelope {
    /// Wrap a message, stamping time and id
    pub fn seal(sender: impl Into<PeerId>, message: &Message) -> Result<Self> {
        let sender = sender.into();
        let now = Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_millis().saturating_mul(1_000_000));
        Ok(Self {
            message_type: message.message_type(),
            msg_id: message_id(&sender, nanos),
            sender,
            payload: message.payload()?,
            timestamp: now.timestamp_millis(),
        })
    }

    /// Decode the payload according to the envelope type
    pub fn open(&self) -> Result<Message> {
        let message = match self.message_type {
            MessageType::Announce => Message::Announce(self.decode()?),
            MessageType::AnnounceAck => Message::AnnounceAck(self.decode()?),
            MessageType::Heartbeat => Message::Heartbeat(self.decode()?),
            MessageType::Goodbye => Message::Goodbye,
            MessageType::SyncRequest => Message::SyncRequest(self.decode()?),
            MessageType::SyncManifest => Message::SyncManifest(self.decode()?),
            MessageType::SyncDelta => Message::SyncDelta(self.decode()?),
            MessageType::FileRequest => Message::FileRequest(self.decode()?),
            MessageType::FileHeader => Message::FileHeader(self.decode()?),
            MessageType::FileChunk => Message::FileChunk(self.decode()?),
            MessageType::FileComplete => Message::FileComplete(self.decode()?),
            MessageType::FileAck => Message::FileAck(self.decode()?),
            MessageType::FileError => Message::FileError(self.decode()?),
        };
        Ok(message)
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::protocol(format!(
                "Malformed {} payload from {}: {}",
                self.message_type, self.sender, e
            ))
        })
    }

    /// UTF-8 JSON encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::protocol(format!("Failed to encode envelope: {}", e)))
    }

    /// Parse UTF-8 JSON; unknown types are rejected here
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::protocol(format!("Failed to decode envelope: {}", e)))
    }
}

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn message_id(sender: &str, nanos: i64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_bytes());
    hasher.update(&nanos.to_be_bytes());
    // Two envelopes sealed within one clock tick still get distinct ids
    hasher.update(&MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

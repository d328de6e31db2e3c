//! Typed event channel
//!
//! Events are pushed with `try_send` into a bounded channel. When the single
//! subscriber falls behind, new events are dropped instead of stalling the
//! discovery and sync loops.

use lansync_types::{Peer, PeerId, SyncStats};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Something observable happened on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// First message from a new peer
    PeerDiscovered {
        /// The new peer
        peer: Peer,
    },
    /// Peer said goodbye or was reaped
    PeerLeft {
        /// Departed peer
        peer_id: PeerId,
    },
    /// A session is about to connect
    SyncStarted {
        /// Remote node
        peer_id: PeerId,
    },
    /// A session ran to completion, possibly with per-file failures
    SyncCompleted {
        /// Remote node
        peer_id: PeerId,
        /// Session counters
        stats: SyncStats,
    },
    /// A session was cut short
    SyncFailed {
        /// Remote node
        peer_id: PeerId,
        /// What went wrong
        error: String,
        /// Counters up to the failure
        stats: SyncStats,
    },
    /// One file was verified and committed
    FileSynced {
        /// Source node
        peer_id: PeerId,
        /// Relative path
        path: String,
        /// Uncompressed size
        bytes: u64,
    },
}

impl SyncEvent {
    /// Topic name, e.g. `peer:discovered`
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerDiscovered { .. } => "peer:discovered",
            Self::PeerLeft { .. } => "peer:left",
            Self::SyncStarted { .. } => "sync:started",
            Self::SyncCompleted { .. } => "sync:completed",
            Self::SyncFailed { .. } => "sync:failed",
            Self::FileSynced { .. } => "file:synced",
        }
    }
}

/// Producer half of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<SyncEvent>,
}

impl EventSink {
    /// Bounded channel with room for `capacity` events
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Publish without waiting
    pub fn emit(&self, event: SyncEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!("Event channel full, dropping {}", event.name());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

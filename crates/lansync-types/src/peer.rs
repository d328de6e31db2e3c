//! Peer records tracked by the discovery layer

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Stable node identifier
pub type PeerId = String;

/// Wire protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Discovery state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Not yet heard from
    Unknown,
    /// First announce seen, not yet confirmed
    Announced,
    /// Refreshed at least once and within the timeout
    Alive,
    /// Silent for longer than the peer timeout
    Stale,
    /// Said goodbye or was reaped
    Removed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Announced => "announced",
            Self::Alive => "alive",
            Self::Stale => "stale",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// A remote node as seen by the peer directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable node id
    pub id: PeerId,
    /// Human readable name
    pub display_name: String,
    /// Transfer endpoint
    pub address: SocketAddr,
    /// Protocol version advertised by the peer
    pub protocol_version: u32,
    /// Last time any discovery message arrived from this peer
    pub last_seen_at: DateTime<Utc>,
    /// First time this peer was seen
    pub first_seen_at: DateTime<Utc>,
    /// Logical roots offered by the peer
    pub shared_folders: Vec<String>,
    /// Discovery state
    pub state: PeerState,
}

impl Peer {
    /// Create a freshly announced peer
    pub fn announced(
        id: impl Into<PeerId>,
        display_name: impl Into<String>,
        address: SocketAddr,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address,
            protocol_version: PROTOCOL_VERSION,
            last_seen_at: now,
            first_seen_at: now,
            shared_folders: Vec::new(),
            state: PeerState::Announced,
        }
    }

    /// `now - last_seen_at < timeout`
    pub fn is_online(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::MAX);
        now.signed_duration_since(self.last_seen_at) < timeout
    }

    /// Time since the last discovery message
    pub fn silence(&self, now: DateTime<Utc>) -> std::time::Duration {
        now.signed_duration_since(self.last_seen_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Whether a sync session may be opened to this peer
    pub fn is_syncable(&self) -> bool {
        self.state == PeerState::Alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(now: DateTime<Utc>) -> Peer {
        Peer::announced("node-a", "laptop", "127.0.0.1:42421".parse().unwrap(), now)
    }

    #[test]
    fn test_announced_peer_defaults() {
        let now = Utc::now();
        let p = peer(now);
        assert_eq!(p.state, PeerState::Announced);
        assert_eq!(p.first_seen_at, now);
        assert!(!p.is_syncable());
    }

    #[test]
    fn test_online_flag_follows_timeout() {
        let now = Utc::now();
        let p = peer(now);
        let timeout = std::time::Duration::from_secs(15);

        assert!(p.is_online(now + Duration::seconds(14), timeout));
        assert!(!p.is_online(now + Duration::seconds(15), timeout));
        assert_eq!(
            p.silence(now + Duration::seconds(3)),
            std::time::Duration::from_secs(3)
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PeerState::Alive.to_string(), "alive");
        assert_eq!(PeerState::Stale.to_string(), "stale");
    }
}

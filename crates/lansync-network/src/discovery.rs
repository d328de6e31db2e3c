//! Peer discovery: the peer directory state machine and the UDP socket
//!
//! Peers move through `Unknown -> Announced -> Alive -> Stale -> Removed`.
//! The [`PeerDirectory`] is the only owner of peer records; everything else
//! gets snapshots.

use crate::protocol::{Envelope, Message, PeerInfo};
use chrono::{DateTime, Utc};
use lansync_config::DiscoveryConfig;
use lansync_types::{Error, Peer, PeerId, PeerState, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Number of recent message ids remembered for dedup
pub const DEDUP_WINDOW: usize = 256;

/// Largest discovery datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// What handling one discovery envelope did to the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUpdate {
    /// Self-message, duplicate or otherwise irrelevant
    Ignored,
    /// First contact with a peer
    Discovered {
        /// The new record
        peer: Peer,
        /// Reply with `ANNOUNCE_ACK` to this source address
        ack_to: Option<SocketAddr>,
    },
    /// Known peer refreshed
    Refreshed {
        /// The updated record
        peer: Peer,
        /// The peer was not alive before this message
        revived: bool,
    },
    /// Peer said goodbye
    Left {
        /// The removed record
        peer: Peer,
    },
}

/// Transition produced by the reaper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapEvent {
    /// Silent past the peer timeout
    Stale(Peer),
    /// Stale past the retention window, dropped
    Removed(Peer),
}

#[derive(Debug, Default)]
struct SeenMessages {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    /// Returns false when the id was already seen
    fn insert(&mut self, msg_id: &str) -> bool {
        if self.ids.contains(msg_id) {
            return false;
        }
        if self.order.len() >= DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(msg_id.to_string());
        self.ids.insert(msg_id.to_string());
        true
    }
}

/// Table of known peers and their liveness
#[derive(Debug)]
pub struct PeerDirectory {
    local_id: PeerId,
    peer_timeout: Duration,
    reap_after: Duration,
    peers: RwLock<HashMap<PeerId, Peer>>,
    seen: Mutex<SeenMessages>,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new(local_id: impl Into<PeerId>, peer_timeout: Duration, reap_after: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            peer_timeout,
            reap_after,
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenMessages::default()),
        }
    }

    /// Directory configured from the discovery section
    pub fn from_config(local_id: impl Into<PeerId>, config: &DiscoveryConfig) -> Self {
        Self::new(local_id, config.peer_timeout(), config.reap_after())
    }

    /// This node's id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Silence after which a peer is stale
    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    /// Apply one discovery envelope received from `source`
    pub async fn handle(
        &self,
        envelope: &Envelope,
        source: SocketAddr,
        now: DateTime<Utc>,
    ) -> Result<DirectoryUpdate> {
        if envelope.sender == self.local_id {
            return Ok(DirectoryUpdate::Ignored);
        }

        if !self.remember(&envelope.msg_id) {
            debug!("Dropping duplicate {} from {}", envelope.msg_id, envelope.sender);
            return Ok(DirectoryUpdate::Ignored);
        }

        let message = envelope.open()?;
        let (info, transfer_port, is_announce) = match message {
            Message::Announce(info) => {
                let port = info.transfer_port;
                (Some(info), port, true)
            }
            Message::AnnounceAck(info) => {
                let port = info.transfer_port;
                (Some(info), port, false)
            }
            Message::Heartbeat(beat) => (None, beat.transfer_port, false),
            Message::Goodbye => return Ok(self.remove(&envelope.sender).await),
            other => {
                return Err(Error::protocol(format!(
                    "{} is not a discovery message",
                    other.message_type()
                )))
            }
        };

        let address = SocketAddr::new(source.ip(), transfer_port);
        let mut peers = self.peers.write().await;
        match peers.get_mut(&envelope.sender) {
            Some(peer) => {
                let revived = peer.state != PeerState::Alive;
                peer.address = address;
                if let Some(info) = &info {
                    apply_info(peer, info);
                }
                peer.last_seen_at = now;
                peer.state = PeerState::Alive;
                if revived {
                    info!("Peer {} ({}) is alive at {}", peer.display_name, peer.id, peer.address);
                }
                Ok(DirectoryUpdate::Refreshed {
                    peer: peer.clone(),
                    revived,
                })
            }
            None => {
                // A heartbeat alone names the peer by id until its next announce
                let display_name = info
                    .as_ref()
                    .map_or_else(|| envelope.sender.clone(), |info| info.display_name.clone());
                let mut peer =
                    Peer::announced(envelope.sender.clone(), display_name, address, now);
                if let Some(info) = &info {
                    apply_info(&mut peer, info);
                }
                info!(
                    "Discovered peer {} ({}) at {} via {}",
                    peer.display_name, peer.id, peer.address, envelope.message_type
                );
                peers.insert(peer.id.clone(), peer.clone());
                Ok(DirectoryUpdate::Discovered {
                    peer,
                    ack_to: is_announce.then_some(source),
                })
            }
        }
    }

    fn remember(&self, msg_id: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(msg_id),
            Err(poisoned) => poisoned.into_inner().insert(msg_id),
        }
    }

    async fn remove(&self, peer_id: &str) -> DirectoryUpdate {
        match self.peers.write().await.remove(peer_id) {
            Some(mut peer) => {
                peer.state = PeerState::Removed;
                info!("Peer {} ({}) left", peer.display_name, peer.id);
                DirectoryUpdate::Left { peer }
            }
            None => DirectoryUpdate::Ignored,
        }
    }

    /// Mark silent peers stale and drop long-stale ones
    pub async fn reap(&self, now: DateTime<Utc>) -> Vec<ReapEvent> {
        let mut events = Vec::new();
        let mut peers = self.peers.write().await;

        peers.retain(|_, peer| {
            let silence = peer.silence(now);
            match peer.state {
                PeerState::Announced | PeerState::Alive if silence > self.peer_timeout => {
                    warn!(
                        "Peer {} ({}) is stale, silent for {:?}",
                        peer.display_name, peer.id, silence
                    );
                    peer.state = PeerState::Stale;
                    events.push(ReapEvent::Stale(peer.clone()));
                    true
                }
                PeerState::Stale if silence > self.peer_timeout + self.reap_after => {
                    info!("Reaping peer {} ({})", peer.display_name, peer.id);
                    let mut removed = peer.clone();
                    removed.state = PeerState::Removed;
                    events.push(ReapEvent::Removed(removed));
                    false
                }
                _ => true,
            }
        });

        events
    }

    /// All known peers, sorted by id
    pub async fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Peers in `Alive` state that are within the timeout
    pub async fn alive_peers(&self, now: DateTime<Utc>) -> Vec<Peer> {
        self.peers()
            .await
            .into_iter()
            .filter(|peer| peer.state == PeerState::Alive && peer.is_online(now, self.peer_timeout))
            .collect()
    }

    /// Look up one peer
    pub async fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Number of known peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peers are known
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

fn apply_info(peer: &mut Peer, info: &PeerInfo) {
    peer.display_name.clone_from(&info.display_name);
    peer.protocol_version = info.protocol_version;
    peer.shared_folders.clone_from(&info.shared_folders);
}

/// UDP socket joined to the discovery multicast group
#[derive(Debug)]
pub struct DiscoverySocket {
    socket: UdpSocket,
    group: SocketAddr,
}

impl DiscoverySocket {
    /// Bind the discovery port and join the multicast group.
    ///
    /// Binding failures are fatal. A failed group join is logged; the socket
    /// still receives unicast acks.
    pub fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;

        if let Err(e) = socket.join_multicast_v4(&config.multicast_group, &config.interface) {
            warn!(
                "Could not join multicast group {} on {}: {}",
                config.multicast_group, config.interface, e
            );
        }
        if let Err(e) = socket.set_multicast_loop_v4(config.multicast_loop) {
            debug!("Could not set multicast loop: {}", e);
        }
        if let Err(e) = socket.set_multicast_ttl_v4(config.multicast_ttl) {
            debug!("Could not set multicast ttl: {}", e);
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| Error::bind(bind_addr, e.to_string()))?;

        let local = socket.local_addr().map_err(|e| Error::bind(bind_addr, e.to_string()))?;
        info!(
            "Discovery listening on {} (group {})",
            local,
            config.group_addr()
        );

        Ok(Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(config.multicast_group, local.port())),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to read local address: {}", e)))
    }

    /// Send to the multicast group
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        self.send_to(envelope, self.group).await
    }

    /// Unicast an envelope
    pub async fn send_to(&self, envelope: &Envelope, target: SocketAddr) -> Result<()> {
        let data = envelope.to_bytes()?;
        self.socket
            .send_to(&data, target)
            .await
            .map_err(|e| Error::network(format!("Failed to send {} to {}: {}", envelope.message_type, target, e)))?;
        Ok(())
    }

    /// Receive one datagram and parse it.
    ///
    /// Socket failures are `Network` errors; malformed datagrams are
    /// `Protocol` errors and the caller should keep listening.
    pub async fn recv(&self) -> Result<(Envelope, SocketAddr)> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, source) = self
            .socket
            .recv_from(&mut buffer)
            .await
            .map_err(|e| Error::network(format!("Discovery receive failed: {}", e)))?;

        let envelope = Envelope::from_bytes(&buffer[..len])?;
        if !envelope.message_type.is_discovery() {
            return Err(Error::protocol(format!(
                "Unexpected {} on discovery channel from {}",
                envelope.message_type, source
            )));
        }
        Ok((envelope, source))
    }
}

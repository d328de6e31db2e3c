//! Sync orchestrator
//!
//! [`SyncOrchestrator`] owns a node's long-lived state (local manifest, peer
//! directory, statistics, event sink) and its background loops:
//!
//! - announce: multicast `ANNOUNCE` every discovery interval
//! - receive: apply discovery datagrams to the peer directory
//! - heartbeat: multicast `HEARTBEAT` and reap silent peers
//! - accept: the transfer server
//! - auto-sync: optional periodic [`SyncOrchestrator::sync_with_all`]
//!
//! All loops watch one shutdown channel.

use crate::events::{EventSink, SyncEvent};
use crate::identity::NodeIdentity;
use crate::stats::{EngineStats, StatisticsCollector};
use chrono::Utc;
use lansync_config::{Config, ConfigLoader};
use lansync_network::{
    DirectoryUpdate, DiscoverySocket, Envelope, HeartbeatInfo, Message, PeerDirectory, PeerInfo,
    ReapEvent,
    ServerContext, ServerStats, SessionConfig, SessionReport, SyncSession, TransferServer,
};
use lansync_sync::{LocalManifest, ManifestBuilder, ManifestOptions};
use lansync_types::{Error, Peer, PeerId, Result, SyncStats, TransferState};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sends and applies discovery traffic for a running node
#[derive(Debug)]
struct DiscoveryAgent {
    local_id: PeerId,
    presence: PeerInfo,
    socket: Option<Arc<DiscoverySocket>>,
    directory: Arc<PeerDirectory>,
    events: EventSink,
}

impl DiscoveryAgent {
    async fn broadcast(&self, message: Message) {
        let Some(socket) = &self.socket else {
            return;
        };
        let sent = match Envelope::seal(self.local_id.clone(), &message) {
            Ok(envelope) => socket.broadcast(&envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Failed to broadcast {}: {}", message.message_type(), e);
        }
    }

    async fn handle(&self, envelope: &Envelope, source: SocketAddr) -> Result<DirectoryUpdate> {
        let update = self.directory.handle(envelope, source, Utc::now()).await?;
        match &update {
            DirectoryUpdate::Discovered { peer, ack_to } => {
                if let (Some(target), Some(socket)) = (ack_to, &self.socket) {
                    let ack = Envelope::seal(
                        self.local_id.clone(),
                        &Message::AnnounceAck(self.presence.clone()),
                    )?;
                    if let Err(e) = socket.send_to(&ack, *target).await {
                        warn!("Failed to acknowledge {}: {}", peer.id, e);
                    }
                }
                self.events.emit(SyncEvent::PeerDiscovered { peer: peer.clone() });
            }
            DirectoryUpdate::Left { peer } => {
                self.events.emit(SyncEvent::PeerLeft {
                    peer_id: peer.id.clone(),
                });
            }
            DirectoryUpdate::Refreshed { .. } | DirectoryUpdate::Ignored => {}
        }
        Ok(update)
    }

    async fn reap(&self) {
        for event in self.directory.reap(Utc::now()).await {
            if let ReapEvent::Removed(peer) = event {
                self.events.emit(SyncEvent::PeerLeft { peer_id: peer.id });
            }
        }
    }
}

/// Handles owned while the node runs
#[derive(Debug)]
struct Runtime {
    shutdown: watch::Sender<bool>,
    agent: Arc<DiscoveryAgent>,
    loops: Vec<JoinHandle<()>>,
    server: JoinHandle<Result<()>>,
    server_stats: Arc<ServerStats>,
    transfer_addr: SocketAddr,
    discovery_addr: Option<SocketAddr>,
}

/// A LanSync node
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    config: Arc<Config>,
    identity: Arc<NodeIdentity>,
    local: Arc<LocalManifest>,
    directory: Arc<PeerDirectory>,
    statistics: Arc<StatisticsCollector>,
    events: EventSink,
    event_receiver: Arc<StdMutex<Option<mpsc::Receiver<SyncEvent>>>>,
    runtime: Arc<Mutex<Option<Runtime>>>,
    session_lock: Arc<Mutex<()>>,
}

impl SyncOrchestrator {
    /// Node with configuration from the default locations
    pub fn new() -> Result<Self> {
        let config = ConfigLoader::load_default()?;
        Self::with_config(config)
    }

    /// Node with an explicit configuration
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;

        let identity = NodeIdentity::resolve(&config.node);
        let options = ManifestOptions {
            exclude: config.node.exclude.clone(),
            track_directories: config.node.track_directories,
            fast_rescan: config.node.fast_rescan,
        };
        let builder = ManifestBuilder::new(config.node.sync_root.clone(), options)?;
        let directory = PeerDirectory::from_config(identity.id.clone(), &config.discovery);
        let (events, receiver) = EventSink::channel(config.sync.event_buffer);

        info!(
            "Node {} ({}) syncing {}",
            identity.display_name,
            identity.id,
            config.node.sync_root.display()
        );

        Ok(Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            local: Arc::new(LocalManifest::new(builder)),
            directory: Arc::new(directory),
            statistics: Arc::new(StatisticsCollector::new()),
            events,
            event_receiver: Arc::new(StdMutex::new(Some(receiver))),
            runtime: Arc::new(Mutex::new(None)),
            session_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Bind sockets, scan the sync root and spawn the loops.
    ///
    /// Calling `start` on a running node does nothing. Bind failures are
    /// returned and leave the node stopped.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("Node {} already running", self.identity.id);
            return Ok(());
        }

        tokio::fs::create_dir_all(self.local.root())
            .await
            .map_err(|e| Error::Io {
                message: format!(
                    "Failed to create sync root '{}': {}",
                    self.local.root().display(),
                    e
                ),
            })?;
        let files = self.local.rescan().await?;
        info!("Local manifest has {} files", files);

        let transfer = &self.config.transfer;
        let context = ServerContext::new(self.identity.id.clone(), Arc::clone(&self.local), transfer);
        let server = TransferServer::bind(transfer.listen_addr(), context).await?;
        let transfer_addr = server.local_addr()?;
        let server_stats = server.stats();

        let discovery = &self.config.discovery;
        let socket = if discovery.enabled {
            Some(Arc::new(DiscoverySocket::bind(discovery)?))
        } else {
            info!("Discovery disabled, peers must be added by incoming messages");
            None
        };
        let discovery_addr = match &socket {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };

        let agent = Arc::new(DiscoveryAgent {
            local_id: self.identity.id.clone(),
            presence: PeerInfo::new(
                self.identity.display_name.clone(),
                transfer_addr.port(),
                self.config.node.shared_folders.clone(),
            ),
            socket,
            directory: Arc::clone(&self.directory),
            events: self.events.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(server.run(shutdown_rx.clone(), transfer.shutdown_grace()));

        let mut loops = Vec::new();
        if let Some(socket) = &agent.socket {
            loops.push(tokio::spawn(announce_loop(
                Arc::clone(&agent),
                discovery.announce_interval(),
                shutdown_rx.clone(),
            )));
            loops.push(tokio::spawn(receive_loop(
                Arc::clone(&agent),
                Arc::clone(socket),
                shutdown_rx.clone(),
            )));
        }
        loops.push(tokio::spawn(heartbeat_loop(
            Arc::clone(&agent),
            discovery.heartbeat_interval(),
            shutdown_rx.clone(),
        )));
        if let Some(interval) = self.config.sync.auto_sync_interval() {
            loops.push(tokio::spawn(auto_sync_loop(
                self.clone(),
                interval,
                shutdown_rx,
            )));
        }

        self.statistics.mark_started().await;
        info!(
            "Node {} started, transfer on {}, discovery on {}",
            self.identity.id,
            transfer_addr,
            discovery_addr.map_or_else(|| "-".to_string(), |addr| addr.to_string())
        );

        *runtime = Some(Runtime {
            shutdown,
            agent,
            loops,
            server,
            server_stats,
            transfer_addr,
            discovery_addr,
        });
        Ok(())
    }

    /// Say goodbye, stop the loops and close the listener.
    ///
    /// In-flight inbound sessions get the configured grace period.
    pub async fn stop(&self) -> Result<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        runtime.agent.broadcast(Message::Goodbye).await;
        if runtime.shutdown.send(true).is_err() {
            debug!("All loops already finished");
        }

        let grace = self.config.transfer.shutdown_grace();
        for mut handle in runtime.loops {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Background loop did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }

        match runtime.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Transfer server stopped with error: {}", e),
            Err(e) => warn!("Transfer server task failed: {}", e),
        }

        self.statistics.mark_stopped().await;
        info!("Node {} stopped", self.identity.id);
        Ok(())
    }

    /// Run one session against an alive peer
    pub async fn sync_with_peer(&self, peer_id: &str) -> Result<SyncStats> {
        let peer = self
            .directory
            .get(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound {
                peer_id: peer_id.to_string(),
            })?;

        if !peer.is_syncable() || !peer.is_online(Utc::now(), self.directory.peer_timeout()) {
            return Err(Error::PeerUnavailable {
                peer_id: peer.id,
                state: peer.state.to_string(),
            });
        }

        Ok(self.run_session(peer).await.stats)
    }

    /// Sync with every alive peer in turn; one failure does not stop the rest
    pub async fn sync_with_all(&self) -> BTreeMap<PeerId, SyncStats> {
        let peers = self.directory.alive_peers(Utc::now()).await;
        let mut results = BTreeMap::new();
        for peer in peers {
            let peer_id = peer.id.clone();
            let report = self.run_session(peer).await;
            results.insert(peer_id, report.stats);
        }
        results
    }

    async fn run_session(&self, peer: Peer) -> SessionReport {
        let _serialized = self.session_lock.lock().await;
        let peer_id = peer.id.clone();
        self.events.emit(SyncEvent::SyncStarted {
            peer_id: peer_id.clone(),
        });

        let config = SessionConfig::from_config(&self.config.transfer, self.config.sync.conflict_policy);
        let report = SyncSession::new(self.identity.id.clone(), peer, Arc::clone(&self.local), config)
            .run()
            .await;

        for task in &report.tasks {
            if task.state == TransferState::Completed && !task.file_entry.is_directory {
                self.events.emit(SyncEvent::FileSynced {
                    peer_id: peer_id.clone(),
                    path: task.file_entry.relative_path.clone(),
                    bytes: task.bytes_transferred,
                });
            }
        }

        self.statistics.record(&report).await;
        match &report.failure {
            None => self.events.emit(SyncEvent::SyncCompleted {
                peer_id,
                stats: report.stats.clone(),
            }),
            Some(error) => self.events.emit(SyncEvent::SyncFailed {
                peer_id,
                error: error.clone(),
                stats: report.stats.clone(),
            }),
        }
        report
    }

    /// Rebuild the local manifest, returns the file count
    pub async fn scan_local(&self) -> Result<usize> {
        self.local.rescan().await
    }

    /// Apply a discovery envelope as if it arrived on the discovery socket
    pub async fn handle_discovery(&self, envelope: &Envelope, source: SocketAddr) -> Result<DirectoryUpdate> {
        let agent = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.agent));

        match agent {
            Some(agent) => agent.handle(envelope, source).await,
            None => {
                let offline = DiscoveryAgent {
                    local_id: self.identity.id.clone(),
                    presence: PeerInfo::new(
                        self.identity.display_name.clone(),
                        self.config.transfer.port,
                        self.config.node.shared_folders.clone(),
                    ),
                    socket: None,
                    directory: Arc::clone(&self.directory),
                    events: self.events.clone(),
                };
                offline.handle(envelope, source).await
            }
        }
    }

    /// Run the reaper once
    pub async fn reap_peers(&self) {
        let agent = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.agent));
        match agent {
            Some(agent) => agent.reap().await,
            None => {
                for event in self.directory.reap(Utc::now()).await {
                    if let ReapEvent::Removed(peer) = event {
                        self.events.emit(SyncEvent::PeerLeft { peer_id: peer.id });
                    }
                }
            }
        }
    }

    /// All known peers
    pub async fn get_peers(&self) -> Vec<Peer> {
        self.directory.peers().await
    }

    /// Current statistics
    pub async fn get_stats(&self) -> EngineStats {
        let (running, server) = match self.runtime.lock().await.as_ref() {
            Some(runtime) => (true, runtime.server_stats.snapshot()),
            None => (false, Default::default()),
        };
        self.statistics
            .build(
                running,
                self.directory.len().await,
                self.directory.alive_peers(Utc::now()).await.len(),
                self.local.file_count().await,
                server,
            )
            .await
    }

    /// Take the event receiver; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        match self.event_receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// This node's id
    pub fn node_id(&self) -> &str {
        &self.identity.id
    }

    /// This node's display name
    pub fn display_name(&self) -> &str {
        &self.identity.display_name
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared local manifest
    pub fn local_manifest(&self) -> Arc<LocalManifest> {
        Arc::clone(&self.local)
    }

    /// Shared peer directory
    pub fn peer_directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.directory)
    }

    /// Whether the loops are running
    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Bound transfer address while running
    pub async fn transfer_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|runtime| runtime.transfer_addr)
    }

    /// Bound discovery address while running with discovery enabled
    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .and_then(|runtime| runtime.discovery_addr)
    }
}

async fn announce_loop(agent: Arc<DiscoveryAgent>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                agent.broadcast(Message::Announce(agent.presence.clone())).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Announce loop stopped");
}

async fn receive_loop(
    agent: Arc<DiscoveryAgent>,
    socket: Arc<DiscoverySocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = socket.recv() => match received {
                Ok((envelope, source)) => {
                    if let Err(e) = agent.handle(&envelope, source).await {
                        debug!("Ignoring discovery message from {}: {}", source, e);
                    }
                }
                Err(Error::Protocol { message }) => debug!("Dropping datagram: {}", message),
                Err(e) => {
                    warn!("Discovery socket error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Discovery receive loop stopped");
}

async fn heartbeat_loop(agent: Arc<DiscoveryAgent>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = HeartbeatInfo {
                    transfer_port: agent.presence.transfer_port,
                };
                agent.broadcast(Message::Heartbeat(beat)).await;
                agent.reap().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Heartbeat loop stopped");
}

async fn auto_sync_loop(orchestrator: SyncOrchestrator, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.scan_local().await {
                    warn!("Rescan before auto-sync failed: {}", e);
                }
                let results = orchestrator.sync_with_all().await;
                debug!("Auto-sync finished with {} peers", results.len());
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Auto-sync loop stopped");
}

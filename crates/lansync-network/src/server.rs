//! Responder side of the transfer channel
//!
//! [`TransferServer`] accepts TCP connections and serves each one on its own
//! task with [`serve_connection`]. The responder only answers: it sends its
//! manifest and streams the files it is asked for. Each served file is
//! tracked as a sending [`TransferTask`] that completes on the initiator's
//! `FILE_ACK`.

use crate::connection::Connection;
use crate::protocol::{
    FileChunk, FileComplete, FileError, FileHeader, ManifestPayload, Message,
};
use bytes::Bytes;
use lansync_compression::ChunkCodec;
use lansync_config::TransferConfig;
use lansync_sync::{resolve_relative, LocalManifest};
use lansync_types::{
    Error, FileEntry, Manifest, PeerId, Result, TransferDirection, TransferState, TransferTask,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Responder counters
#[derive(Debug, Default)]
pub struct ServerStats {
    connections: AtomicU64,
    files_served: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatsSnapshot {
    /// Accepted connections
    pub connections: u64,
    /// Files acknowledged by initiators
    pub files_served: u64,
    /// Uncompressed bytes streamed
    pub bytes_sent: u64,
    /// Connections that ended in an error
    pub errors: u64,
}

impl ServerStats {
    /// Copy the counters
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            files_served: self.files_served.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Everything a connection handler needs
#[derive(Debug)]
pub struct ServerContext {
    /// This node's id
    pub local_id: PeerId,
    /// Manifest served to initiators
    pub local: Arc<LocalManifest>,
    /// Uncompressed bytes per chunk
    pub chunk_size: usize,
    /// zlib level, 0 sends chunks uncompressed
    pub compression_level: u32,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// Idle limit between initiator messages
    pub read_timeout: Option<Duration>,
    /// Shared counters
    pub stats: Arc<ServerStats>,
}

impl ServerContext {
    /// Context built from the transfer section
    pub fn new(local_id: impl Into<PeerId>, local: Arc<LocalManifest>, transfer: &TransferConfig) -> Self {
        Self {
            local_id: local_id.into(),
            local,
            chunk_size: transfer.chunk_size,
            compression_level: transfer.compression_level,
            max_frame_size: transfer.max_frame_size,
            read_timeout: Some(transfer.read_timeout()),
            stats: Arc::new(ServerStats::default()),
        }
    }
}

/// TCP listener for sync sessions
#[derive(Debug)]
pub struct TransferServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl TransferServer {
    /// Bind the listener; failure is fatal for the node
    pub async fn bind(addr: SocketAddr, context: ServerContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bind(addr, e.to_string()))?;
        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to read local address: {}", e)))
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.context.stats)
    }

    /// Accept until `shutdown` flips to true, then give in-flight sessions
    /// `grace` to finish before aborting them
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> Result<()> {
        info!("Transfer server listening on {}", self.local_addr()?);
        let mut handlers = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        self.context.stats.connections.fetch_add(1, Ordering::Relaxed);
                        debug!("Accepted connection from {}", remote);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
                        }

                        let context = Arc::clone(&self.context);
                        handlers.spawn(async move {
                            let mut connection = Connection::new(
                                stream,
                                context.local_id.clone(),
                                remote.to_string(),
                                context.max_frame_size,
                            );
                            if let Some(timeout) = context.read_timeout {
                                connection = connection.with_read_timeout(timeout);
                            }
                            match serve_connection(connection, &context).await {
                                Ok(tasks) => debug!(
                                    "Session from {} served {} files",
                                    remote,
                                    tasks.len()
                                ),
                                Err(e) => {
                                    context.stats.errors.fetch_add(1, Ordering::Relaxed);
                                    warn!("Session from {} ended with error: {}", remote, e);
                                }
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session task failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Transfer server stopping, {} sessions in flight",
            handlers.len()
        );
        let drained = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} sessions after {:?} grace period", handlers.len(), grace);
            handlers.abort_all();
        }

        Ok(())
    }
}

/// Answer one initiator until it closes the connection.
///
/// Returns one sending task per streamed file; files the initiator never
/// acknowledged come back failed.
pub async fn serve_connection<S>(
    mut connection: Connection<S>,
    context: &ServerContext,
) -> Result<Vec<TransferTask>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut snapshot: Option<Manifest> = None;
    let mut awaiting_ack: HashMap<String, TransferTask> = HashMap::new();
    let mut served = Vec::new();

    while let Some(envelope) = connection.recv_envelope().await? {
        let sender = envelope.sender.clone();
        match envelope.open()? {
            Message::SyncRequest(request) => {
                let manifest = context.local.snapshot().await;
                info!(
                    "Sync request from {} ({} entries), serving {} entries",
                    sender,
                    request.manifest.len(),
                    manifest.len()
                );
                connection
                    .send_message(&Message::SyncManifest(ManifestPayload {
                        manifest: manifest.clone(),
                    }))
                    .await?;
                snapshot = Some(manifest);
            }
            Message::SyncDelta(summary) => {
                info!(
                    "{} will download {}, expects us to pull {}, {} conflicts",
                    sender,
                    summary.download.len(),
                    summary.upload.len(),
                    summary.conflicts.len()
                );
            }
            Message::FileRequest(request) => {
                let entry = match &snapshot {
                    Some(manifest) => manifest.get(&request.path).cloned(),
                    None => context.local.get(&request.path).await,
                };
                let Some(task) =
                    serve_file(&mut connection, context, &sender, &request.path, entry).await?
                else {
                    continue;
                };
                if task.state.is_terminal() {
                    served.push(task);
                } else if let Some(mut replaced) =
                    awaiting_ack.insert(task.file_entry.relative_path.clone(), task)
                {
                    replaced.fail("requested again before acknowledgement");
                    served.push(replaced);
                }
            }
            Message::FileAck(ack) => {
                context.stats.files_served.fetch_add(1, Ordering::Relaxed);
                debug!("{} committed '{}'", sender, ack.path);
                match awaiting_ack.remove(&ack.path) {
                    Some(mut task) => {
                        task.complete()?;
                        served.push(task);
                    }
                    None => debug!("Acknowledgement for unsent '{}'", ack.path),
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unexpected {} from initiator {}",
                    other.message_type(),
                    sender
                )))
            }
        }
    }

    for (_, mut task) in awaiting_ack {
        task.fail("not acknowledged by the initiator");
        served.push(task);
    }
    let failed = served
        .iter()
        .filter(|task| task.state == TransferState::Failed)
        .count();
    debug!(
        "Initiator {} closed the connection, {} files sent, {} unconfirmed",
        connection.remote(),
        served.len(),
        failed
    );
    Ok(served)
}

/// Stream one file, `None` when the request was refused
async fn serve_file<S>(
    connection: &mut Connection<S>,
    context: &ServerContext,
    initiator: &str,
    path: &str,
    entry: Option<FileEntry>,
) -> Result<Option<TransferTask>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let entry = match entry {
        Some(entry) if !entry.is_directory => entry,
        _ => return refuse(connection, path, "not in the served manifest").await,
    };

    let file = match resolve_relative(context.local.root(), &entry.relative_path) {
        Ok(full_path) => File::open(&full_path).await,
        Err(e) => return refuse(connection, path, &e.to_string()).await,
    };
    let mut file = match file {
        Ok(file) => file,
        Err(e) => return refuse(connection, path, &e.to_string()).await,
    };

    let mut task = TransferTask::new(initiator, entry.clone(), TransferDirection::Send);
    task.start()?;

    let codec = ChunkCodec::for_level(context.compression_level, context.chunk_size);
    connection
        .send_message(&Message::FileHeader(FileHeader {
            path: entry.relative_path.clone(),
            size: entry.size_bytes,
            hash: entry.content_hash,
            modified_at: entry.modified_at,
            compression: codec.algorithm(),
            chunk_size: context.chunk_size as u32,
        }))
        .await?;

    let mut buffer = vec![0u8; context.chunk_size];
    let mut index = 0u64;
    loop {
        let read = match read_chunk(&mut file, &mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                // Completing early lets the receiver's digest check reject the file
                warn!("Reading '{}' failed after {} chunks: {}", path, index, e);
                task.fail(e.to_string());
                break;
            }
        };

        let compressed = match codec.compress_chunk(&buffer[..read]) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("Compressing chunk {} of '{}' failed: {}", index, path, e);
                task.fail(e.to_string());
                break;
            }
        };

        connection
            .send_message(&Message::FileChunk(FileChunk {
                path: entry.relative_path.clone(),
                index,
                compressed_size: compressed.len() as u32,
            }))
            .await?;
        connection.send_raw(Bytes::from(compressed)).await?;

        context
            .stats
            .bytes_sent
            .fetch_add(read as u64, Ordering::Relaxed);
        task.add_bytes(read as u64);
        index += 1;
    }

    connection
        .send_message(&Message::FileComplete(FileComplete {
            path: entry.relative_path,
            chunks: index,
        }))
        .await?;
    Ok(Some(task))
}

async fn refuse<S>(
    connection: &mut Connection<S>,
    path: &str,
    reason: &str,
) -> Result<Option<TransferTask>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Refusing '{}': {}", path, reason);
    connection
        .send_message(&Message::FileError(FileError {
            path: path.to_string(),
            message: reason.to_string(),
        }))
        .await?;
    Ok(None)
}

/// Fill `buffer` unless the file ends first
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileRequest;
    use crate::session::{SessionConfig, SessionReport, SessionState, SyncSession};
    use chrono::Utc;
    use lansync_sync::{set_modified_millis, ManifestBuilder, ManifestOptions};
    use lansync_types::{ConflictPolicy, Peer, TransferState};
    use std::path::Path;
    use tempfile::TempDir;

    const MAX_FRAME: usize = 1024 * 1024;

    async fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    async fn local_manifest(root: &Path) -> Arc<LocalManifest> {
        let builder = ManifestBuilder::new(root, ManifestOptions::default()).unwrap();
        let local = Arc::new(LocalManifest::new(builder));
        local.rescan().await.unwrap();
        local
    }

    fn context(local: Arc<LocalManifest>, chunk_size: usize) -> ServerContext {
        ServerContext {
            local_id: "responder".to_string(),
            local,
            chunk_size,
            compression_level: 6,
            max_frame_size: MAX_FRAME,
            read_timeout: None,
            stats: Arc::new(ServerStats::default()),
        }
    }

    fn peer() -> Peer {
        Peer::announced("responder", "remote", "127.0.0.1:1".parse().unwrap(), Utc::now())
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            chunk_size: 4096,
            max_frame_size: MAX_FRAME,
            policy: ConflictPolicy::NewestWins,
            ..SessionConfig::default()
        }
    }

    /// Run one session against `remote` over an in-memory pipe, returning
    /// the initiator's report and the responder's sending tasks
    async fn sync_over_pipe(
        remote: Arc<LocalManifest>,
        local: Arc<LocalManifest>,
        policy: ConflictPolicy,
    ) -> (SessionReport, Vec<TransferTask>) {
        let ctx = context(remote, 4096);
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            serve_connection(Connection::new(b, "responder", "pipe", MAX_FRAME), &ctx).await
        });

        let config = SessionConfig {
            policy,
            ..session_config()
        };
        let report = SyncSession::new("initiator", peer(), local, config)
            .run_over(Connection::new(a, "initiator", "pipe", MAX_FRAME))
            .await;
        let sent = server.await.unwrap().unwrap();
        (report, sent)
    }

    async fn read(root: &Path, relative: &str) -> Vec<u8> {
        tokio::fs::read(root.join(relative)).await.unwrap()
    }

    fn part_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn test_session_pulls_missing_files() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        write(remote_dir.path(), "notes.txt", b"hello from the other side").await;
        write(remote_dir.path(), "data/big.bin", &big).await;
        write(remote_dir.path(), "empty.txt", b"").await;

        let remote = local_manifest(remote_dir.path()).await;
        let local = local_manifest(local_dir.path()).await;
        let ctx = context(Arc::clone(&remote), 4096);

        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            let connection = Connection::new(b, "responder", "pipe", MAX_FRAME);
            let result = serve_connection(connection, &ctx).await;
            (result, ctx.stats.snapshot())
        });

        let session = SyncSession::new("initiator", peer(), Arc::clone(&local), session_config());
        assert_eq!(session.state(), SessionState::Idle);
        let report = session
            .run_over(Connection::new(a, "initiator", "pipe", MAX_FRAME))
            .await;

        assert!(report.is_complete(), "{:?}", report.failure);
        assert_eq!(report.stats.files_downloaded, 3);
        assert_eq!(report.stats.bytes_downloaded, big.len() as u64 + 25);
        assert!(report.stats.is_clean());
        assert!(report
            .tasks
            .iter()
            .all(|task| task.state == TransferState::Completed));

        assert_eq!(
            tokio::fs::read(local_dir.path().join("data/big.bin")).await.unwrap(),
            big
        );
        assert_eq!(
            tokio::fs::read(local_dir.path().join("notes.txt")).await.unwrap(),
            b"hello from the other side"
        );

        let remote_entry = remote.get("notes.txt").await.unwrap();
        let local_entry = local.get("notes.txt").await.unwrap();
        assert!(local_entry.is_identical(&remote_entry));
        assert!(part_files(local_dir.path()).is_empty());

        let (result, stats) = server.await.unwrap();
        let sent = result.unwrap();
        assert_eq!(stats.files_served, 3);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|task| {
            task.direction == TransferDirection::Send
                && task.state == TransferState::Completed
                && task.peer_id == "initiator"
        }));
        let big_task = sent
            .iter()
            .find(|task| task.file_entry.relative_path == "data/big.bin")
            .unwrap();
        assert_eq!(big_task.bytes_transferred, big.len() as u64);
    }

    #[tokio::test]
    async fn test_mtime_is_preserved() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "a.txt", b"aaa").await;
        lansync_sync::set_modified_millis(&remote_dir.path().join("a.txt"), 1_600_000_000_000)
            .unwrap();

        let ctx = context(local_manifest(remote_dir.path()).await, 4096);
        let local = local_manifest(local_dir.path()).await;

        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(Connection::new(b, "responder", "pipe", MAX_FRAME), &ctx).await;
        });
        let report = SyncSession::new("initiator", peer(), Arc::clone(&local), session_config())
            .run_over(Connection::new(a, "initiator", "pipe", MAX_FRAME))
            .await;
        assert_eq!(report.stats.files_downloaded, 1);

        let entry = local.get("a.txt").await.unwrap();
        assert_eq!(entry.modified_at, 1_600_000_000_000);

        let rescanned = local_manifest(local_dir.path()).await;
        assert_eq!(rescanned.get("a.txt").await.unwrap().modified_at, 1_600_000_000_000);
    }

    #[tokio::test]
    async fn test_changed_file_fails_integrity_and_leaves_no_partial() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "doc.txt", b"original").await;
        let remote = local_manifest(remote_dir.path()).await;
        // Content changes after the scan, so the advertised digest is stale
        write(remote_dir.path(), "doc.txt", b"modified!").await;

        let ctx = context(remote, 4096);
        let local = local_manifest(local_dir.path()).await;

        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(Connection::new(b, "responder", "pipe", MAX_FRAME), &ctx).await;
        });
        let report = SyncSession::new("initiator", peer(), Arc::clone(&local), session_config())
            .run_over(Connection::new(a, "initiator", "pipe", MAX_FRAME))
            .await;

        assert!(report.is_complete());
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.failed_paths, vec!["doc.txt".to_string()]);
        assert_eq!(report.tasks[0].state, TransferState::Failed);
        assert!(!local_dir.path().join("doc.txt").exists());
        assert!(part_files(local_dir.path()).is_empty());
        assert!(local.get("doc.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_file_gone_from_responder_is_skipped() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "a.txt", b"first").await;
        write(remote_dir.path(), "b.txt", b"second").await;
        let remote = local_manifest(remote_dir.path()).await;
        // Deleted after the manifest was taken
        tokio::fs::remove_file(remote_dir.path().join("a.txt")).await.unwrap();

        let local = local_manifest(local_dir.path()).await;
        let (report, sent) =
            sync_over_pipe(remote, Arc::clone(&local), ConflictPolicy::NewestWins).await;

        assert!(report.is_complete(), "{:?}", report.failure);
        assert_eq!(report.stats.files_skipped, 1);
        assert_eq!(report.stats.files_downloaded, 1);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(report.tasks[0].state, TransferState::Failed);
        assert!(report.tasks[0].error.as_deref().unwrap().contains("peer refused"));
        assert_eq!(report.tasks[1].state, TransferState::Completed);
        assert_eq!(read(local_dir.path(), "b.txt").await, b"second");
        assert!(local.get("a.txt").await.is_none());

        // Refused requests are not tracked as sends
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].file_entry.relative_path, "b.txt");
    }

    #[tokio::test]
    async fn test_local_write_failure_fails_only_that_file() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "a.txt", b"first").await;
        write(remote_dir.path(), "b.txt", b"second").await;
        // A directory occupies the first target
        write(local_dir.path(), "a.txt/inner.bin", b"in the way").await;

        let remote = local_manifest(remote_dir.path()).await;
        let local = local_manifest(local_dir.path()).await;
        let (report, sent) =
            sync_over_pipe(remote, Arc::clone(&local), ConflictPolicy::NewestWins).await;

        assert!(report.is_complete(), "{:?}", report.failure);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.failed_paths, vec!["a.txt".to_string()]);
        assert_eq!(report.stats.files_downloaded, 1);
        let failed: Vec<_> = report
            .tasks
            .iter()
            .filter(|task| task.state == TransferState::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].file_entry.relative_path, "a.txt");

        assert_eq!(read(local_dir.path(), "b.txt").await, b"second");
        assert_eq!(read(local_dir.path(), "a.txt/inner.bin").await, b"in the way");
        assert!(part_files(local_dir.path()).is_empty());

        // The responder never saw an acknowledgement for the failed file
        let unacked: Vec<_> = sent
            .iter()
            .filter(|task| task.state == TransferState::Failed)
            .map(|task| task.file_entry.relative_path.as_str())
            .collect();
        assert_eq!(unacked, vec!["a.txt"]);
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_keep_both_copy_does_not_overwrite_existing_file() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "notes.txt", b"remote").await;
        set_modified_millis(&remote_dir.path().join("notes.txt"), 1_000_000).unwrap();
        write(local_dir.path(), "notes.txt", b"local").await;
        set_modified_millis(&local_dir.path().join("notes.txt"), 3_000_000).unwrap();

        let remote = local_manifest(remote_dir.path()).await;
        let local = local_manifest(local_dir.path()).await;
        // Written after the scan, so only the disk knows about it
        write(local_dir.path(), "notes.responde.txt", b"precious").await;

        let (report, _) = sync_over_pipe(remote, Arc::clone(&local), ConflictPolicy::KeepBoth).await;

        assert!(report.stats.is_clean(), "{:?}", report.stats);
        assert_eq!(report.stats.files_downloaded, 1);
        assert_eq!(read(local_dir.path(), "notes.txt").await, b"local");
        assert_eq!(read(local_dir.path(), "notes.responde.txt").await, b"precious");
        assert_eq!(read(local_dir.path(), "notes.responde.1.txt").await, b"remote");
        assert!(local.get("notes.responde.1.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_keep_both_displacement_does_not_overwrite_existing_file() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "notes.txt", b"remote").await;
        set_modified_millis(&remote_dir.path().join("notes.txt"), 3_000_000).unwrap();
        write(local_dir.path(), "notes.txt", b"local").await;
        set_modified_millis(&local_dir.path().join("notes.txt"), 1_000_000).unwrap();

        let remote = local_manifest(remote_dir.path()).await;
        let local = local_manifest(local_dir.path()).await;
        write(local_dir.path(), "notes.initiato.txt", b"earlier conflict").await;

        let (report, _) = sync_over_pipe(remote, Arc::clone(&local), ConflictPolicy::KeepBoth).await;

        assert!(report.stats.is_clean(), "{:?}", report.stats);
        assert_eq!(read(local_dir.path(), "notes.txt").await, b"remote");
        assert_eq!(
            read(local_dir.path(), "notes.initiato.txt").await,
            b"earlier conflict"
        );
        assert_eq!(read(local_dir.path(), "notes.initiato.1.txt").await, b"local");
        let moved = local.get("notes.initiato.1.txt").await.unwrap();
        assert_eq!(moved.content_hash, lansync_types::ContentHash::of(b"local"));
    }

    #[tokio::test]
    async fn test_protocol_violation_aborts_remaining_queue() {
        let local_dir = TempDir::new().unwrap();
        let local = local_manifest(local_dir.path()).await;
        let manifest: Manifest = vec![
            FileEntry::new("a.txt", lansync_types::ContentHash::of(b"a"), 1, 1),
            FileEntry::new("b.txt", lansync_types::ContentHash::of(b"b"), 1, 1),
        ]
        .into_iter()
        .collect();

        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut responder = Connection::new(b, "responder", "pipe", MAX_FRAME);
            responder.expect_message().await.unwrap();
            responder
                .send_message(&Message::SyncManifest(ManifestPayload { manifest }))
                .await
                .unwrap();
            responder.expect_message().await.unwrap();
            responder.expect_message().await.unwrap();
            // Out-of-place reply to the first FILE_REQUEST
            responder.send_message(&Message::Goodbye).await.unwrap();
            let _ = responder.expect_message().await;
        });

        let report = SyncSession::new("initiator", peer(), Arc::clone(&local), session_config())
            .run_over(Connection::new(a, "initiator", "pipe", MAX_FRAME))
            .await;

        assert!(!report.is_complete());
        assert!(report.failure.is_some());
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.failed_paths, vec!["a.txt".to_string()]);
        // b.txt was never requested
        assert_eq!(report.tasks.len(), 1);
        assert!(local.get("b.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_file_request_gets_file_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a").await;
        let ctx = context(local_manifest(dir.path()).await, 4096);

        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(Connection::new(b, "responder", "pipe", MAX_FRAME), &ctx).await;
        });

        let mut client = Connection::new(a, "initiator", "pipe", MAX_FRAME);
        for path in ["missing.txt", "../etc/passwd"] {
            client
                .send_message(&Message::FileRequest(FileRequest {
                    path: path.to_string(),
                }))
                .await
                .unwrap();
            match client.expect_message().await.unwrap() {
                Message::FileError(error) => assert_eq!(error.path, path),
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unexpected_message_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(local_manifest(dir.path()).await, 4096);

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            serve_connection(Connection::new(b, "responder", "pipe", MAX_FRAME), &ctx).await
        });

        let mut client = Connection::new(a, "initiator", "pipe", MAX_FRAME);
        client.send_message(&Message::Goodbye).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_server_accepts_and_stops_on_shutdown() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write(remote_dir.path(), "x.txt", b"over tcp").await;

        let transfer = TransferConfig {
            port: 0,
            ..TransferConfig::default()
        };
        let ctx = ServerContext::new("responder", local_manifest(remote_dir.path()).await, &transfer);
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx, Duration::from_secs(1)));

        let mut target = peer();
        target.address = addr;
        let report = SyncSession::new(
            "initiator",
            target,
            local_manifest(local_dir.path()).await,
            session_config(),
        )
        .run()
        .await;
        assert_eq!(report.stats.files_downloaded, 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().connections, 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_bind_error() {
        let dir = TempDir::new().unwrap();
        let local = local_manifest(dir.path()).await;
        let first = TransferServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            context(Arc::clone(&local), 4096),
        )
        .await
        .unwrap();

        let err = TransferServer::bind(first.local_addr().unwrap(), context(local, 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_counts_one_error() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut target = peer();
        target.address = addr;
        let report = SyncSession::new(
            "initiator",
            target,
            local_manifest(dir.path()).await,
            session_config(),
        )
        .run()
        .await;

        assert!(!report.is_complete());
        assert_eq!(report.stats.errors, 1);
        assert!(report.tasks.is_empty());
    }
}

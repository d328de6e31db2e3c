//! Initiator side of a sync session
//!
//! A session runs one pass over a single connection:
//!
//! 1. send `SYNC_REQUEST` with the local manifest
//! 2. receive `SYNC_MANIFEST`
//! 3. compute the delta and send `SYNC_DELTA`
//! 4. pull every download in order, verifying and committing each file
//!
//! Transport and protocol failures end the session; failures local to one
//! file only fail that file.

use crate::connection::Connection;
use crate::protocol::{
    AckStatus, DeltaSummary, FileAck, FileHeader, FileRequest, ManifestPayload, Message,
};
use lansync_compression::ChunkCodec;
use lansync_config::TransferConfig;
use lansync_sync::{
    numbered_path, resolve_relative, set_modified_millis, ContentHasher, Delta, DeltaCalculator,
    Download, LocalManifest,
};
use lansync_types::{
    ConflictPolicy, ContentHash, Error, FileEntry, Peer, PeerId, Result, SyncStats,
    TransferDirection, TransferTask,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters of a sync session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Uncompressed bytes per chunk
    pub chunk_size: usize,
    /// zlib level for anything this side sends
    pub compression_level: u32,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-frame read timeout
    pub read_timeout: Duration,
    /// Conflict resolution policy
    pub policy: ConflictPolicy,
}

impl SessionConfig {
    /// Session parameters from the transfer section and a policy
    pub fn from_config(transfer: &TransferConfig, policy: ConflictPolicy) -> Self {
        Self {
            chunk_size: transfer.chunk_size,
            compression_level: transfer.compression_level,
            max_frame_size: transfer.max_frame_size,
            connect_timeout: transfer.connect_timeout(),
            read_timeout: transfer.read_timeout(),
            policy,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), ConflictPolicy::default())
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Opening the connection
    Connecting,
    /// Trading manifests
    ExchangingManifest,
    /// Pulling files
    Transferring,
    /// Closing the connection
    Completing,
    /// Ended by a fatal error
    Error,
}

/// Outcome of one session, also returned when it failed part-way
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Remote node
    pub peer_id: PeerId,
    /// Counters for this session
    pub stats: SyncStats,
    /// One task per attempted download
    pub tasks: Vec<TransferTask>,
    /// Delta computed after the manifest exchange
    pub delta: Delta,
    /// Fatal error that ended the session early
    pub failure: Option<String>,
}

impl SessionReport {
    /// The session ran to completion
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

enum FileOutcome {
    Committed(u64),
    Directory,
    Skipped(String),
    Failed(String),
}

/// Pulls a peer's changes into the local tree
#[derive(Debug)]
pub struct SyncSession {
    local_id: PeerId,
    peer: Peer,
    local: Arc<LocalManifest>,
    config: SessionConfig,
    state: SessionState,
    stats: SyncStats,
    tasks: Vec<TransferTask>,
    delta: Delta,
    file_failure_recorded: bool,
    failure: Option<String>,
    started: Instant,
}

impl SyncSession {
    /// Prepare a session against `peer`
    pub fn new(
        local_id: impl Into<PeerId>,
        peer: Peer,
        local: Arc<LocalManifest>,
        config: SessionConfig,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            peer,
            local,
            config,
            state: SessionState::Idle,
            stats: SyncStats::new(),
            tasks: Vec::new(),
            delta: Delta::default(),
            file_failure_recorded: false,
            failure: None,
            started: Instant::now(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect to the peer's transfer address and run the session
    pub async fn run(mut self) -> SessionReport {
        self.set_state(SessionState::Connecting);
        let connected = Connection::<TcpStream>::connect(
            self.peer.address,
            self.local_id.clone(),
            self.config.connect_timeout,
            self.config.max_frame_size,
        )
        .await;

        match connected {
            Ok(connection) => {
                let connection = connection.with_read_timeout(self.config.read_timeout);
                self.run_over(connection).await
            }
            Err(e) => {
                self.abort(&e);
                self.finish()
            }
        }
    }

    /// Run the session over an established connection
    pub async fn run_over<S>(mut self, mut connection: Connection<S>) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(
            "Starting sync with {} ({}) at {}",
            self.peer.display_name, self.peer.id, self.peer.address
        );

        match self.drive(&mut connection).await {
            Ok(()) => {
                self.set_state(SessionState::Completing);
                if let Err(e) = connection.close().await {
                    debug!("Closing connection to {} failed: {}", self.peer.id, e);
                }
            }
            Err(e) => self.abort(&e),
        }

        self.finish()
    }

    async fn drive<S>(&mut self, connection: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(SessionState::ExchangingManifest);
        let local_manifest = self.local.snapshot().await;
        connection
            .send_message(&Message::SyncRequest(ManifestPayload {
                manifest: local_manifest.clone(),
            }))
            .await?;

        let remote_manifest = match connection.expect_message().await? {
            Message::SyncManifest(payload) => payload.manifest,
            other => {
                return Err(Error::protocol(format!(
                    "Expected SYNC_MANIFEST from {}, got {}",
                    self.peer.id,
                    other.message_type()
                )))
            }
        };

        let delta = DeltaCalculator::new(self.config.policy)
            .with_peers(self.local_id.clone(), self.peer.id.clone())
            .compute(&local_manifest, &remote_manifest);

        info!(
            "Delta with {}: {} to download, {} to upload, {} conflicts",
            self.peer.id,
            delta.to_download.len(),
            delta.to_upload.len(),
            delta.conflicts.len()
        );
        for conflict in &delta.conflicts {
            warn!(
                "Conflict on '{}' needs manual resolution",
                conflict.local.relative_path
            );
        }
        self.stats.files_to_upload = delta.to_upload.len() as u64;
        self.stats.conflicts = delta.conflicts.len() as u64;

        connection
            .send_message(&Message::SyncDelta(DeltaSummary {
                download: delta.download_paths(),
                upload: delta.upload_paths(),
                conflicts: delta.conflict_paths(),
            }))
            .await?;

        self.delta = delta.clone();
        self.set_state(SessionState::Transferring);
        for download in delta.to_download {
            self.fetch(connection, download).await?;
        }

        Ok(())
    }

    async fn fetch<S>(&mut self, connection: &mut Connection<S>, download: Download) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = download.target_path.clone();
        let mut task = TransferTask::new(
            self.peer.id.clone(),
            download.remote.clone(),
            TransferDirection::Receive,
        );
        task.start()?;

        match self.transfer_one(connection, &download, &mut task).await {
            Ok(FileOutcome::Committed(bytes)) => {
                task.complete()?;
                self.stats.files_downloaded += 1;
                self.stats.bytes_downloaded += bytes;
                info!("Synced '{}' ({} bytes) from {}", path, bytes, self.peer.id);
            }
            Ok(FileOutcome::Directory) => {
                task.complete()?;
                debug!("Created directory '{}'", path);
            }
            Ok(FileOutcome::Skipped(reason)) => {
                info!("Skipped '{}': {}", path, reason);
                task.fail(reason);
                self.stats.files_skipped += 1;
            }
            Ok(FileOutcome::Failed(reason)) => {
                warn!("Failed to sync '{}' from {}: {}", path, self.peer.id, reason);
                task.fail(reason);
                self.stats.record_failure(path);
            }
            Err(e) if !e.is_connection_fatal() => {
                warn!("Failed to sync '{}' from {}: {}", path, self.peer.id, e);
                task.fail(e.to_string());
                self.stats.record_failure(path);
            }
            Err(e) => {
                task.fail(e.to_string());
                self.stats.record_failure(path);
                self.file_failure_recorded = true;
                self.tasks.push(task);
                return Err(e);
            }
        }

        self.tasks.push(task);
        Ok(())
    }

    async fn transfer_one<S>(
        &mut self,
        connection: &mut Connection<S>,
        download: &Download,
        task: &mut TransferTask,
    ) -> Result<FileOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let root = self.local.root().to_path_buf();
        let remote = &download.remote;

        let target = match resolve_relative(&root, &download.target_path) {
            Ok(target) => target,
            Err(e) => return Ok(FileOutcome::Failed(e.to_string())),
        };
        if self.local.is_excluded(&download.target_path).await {
            return Ok(FileOutcome::Skipped("excluded locally".to_string()));
        }

        if remote.is_directory {
            if let Err(e) = fs::create_dir_all(&target).await {
                return Ok(FileOutcome::Failed(format!(
                    "Failed to create directory: {}",
                    e
                )));
            }
            self.local
                .upsert(FileEntry::directory(
                    download.target_path.clone(),
                    remote.modified_at,
                ))
                .await;
            return Ok(FileOutcome::Directory);
        }

        if let Some(relative) = download.displace_local_to.as_deref() {
            if let Err(e) = resolve_relative(&root, relative) {
                return Ok(FileOutcome::Failed(e.to_string()));
            }
        }

        connection
            .send_message(&Message::FileRequest(FileRequest {
                path: remote.relative_path.clone(),
            }))
            .await?;

        let header = match connection.expect_message().await? {
            Message::FileHeader(header) if header.path == remote.relative_path => header,
            Message::FileError(error) if error.path == remote.relative_path => {
                return Ok(FileOutcome::Skipped(format!(
                    "peer refused: {}",
                    error.message
                )))
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unexpected {} while fetching '{}'",
                    other.message_type(),
                    remote.relative_path
                )))
            }
        };

        let (partial, actual) = match self
            .receive_chunks(connection, &header, &target, task)
            .await?
        {
            Ok(received) => received,
            Err(reason) => return Ok(FileOutcome::Failed(reason)),
        };

        if actual != header.hash {
            let error = Error::Integrity {
                path: download.target_path.clone(),
                expected: header.hash.to_hex(),
                actual: actual.to_hex(),
            };
            return Ok(FileOutcome::Failed(error.to_string()));
        }

        if let Err(e) = self.commit(download, &header, &target, partial).await {
            return Ok(FileOutcome::Failed(e.to_string()));
        }

        connection
            .send_message(&Message::FileAck(FileAck {
                path: header.path.clone(),
                status: AckStatus::Ok,
            }))
            .await?;

        Ok(FileOutcome::Committed(header.size))
    }

    /// Read chunk frames up to `FILE_COMPLETE`.
    ///
    /// The outer error is fatal for the connection. The inner error is a
    /// local failure; the stream is still drained so the next file starts on
    /// a frame boundary.
    async fn receive_chunks<S>(
        &self,
        connection: &mut Connection<S>,
        header: &FileHeader,
        target: &Path,
        task: &mut TransferTask,
    ) -> Result<std::result::Result<(PartialFile, ContentHash), String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = ChunkCodec::new(
            header.compression,
            self.config.compression_level,
            header.chunk_size as usize,
        );
        let mut hasher = ContentHasher::new();
        let mut local_error = None;
        let mut partial = match PartialFile::create(target).await {
            Ok(partial) => Some(partial),
            Err(e) => {
                local_error = Some(e.to_string());
                None
            }
        };

        let mut expected_index = 0u64;
        loop {
            match connection.expect_message().await? {
                Message::FileChunk(chunk) => {
                    if chunk.path != header.path || chunk.index != expected_index {
                        return Err(Error::protocol(format!(
                            "Out of order chunk {} of '{}', expected {} of '{}'",
                            chunk.index, chunk.path, expected_index, header.path
                        )));
                    }
                    let data = connection.expect_raw().await?;
                    if data.len() != chunk.compressed_size as usize {
                        return Err(Error::protocol(format!(
                            "Chunk {} of '{}' is {} bytes, header said {}",
                            chunk.index,
                            chunk.path,
                            data.len(),
                            chunk.compressed_size
                        )));
                    }
                    expected_index += 1;

                    if local_error.is_some() {
                        continue;
                    }
                    match codec.decompress_chunk(&data) {
                        Ok(plain) => {
                            hasher.update(&plain);
                            task.add_bytes(plain.len() as u64);
                            if let Some(file) = partial.as_mut() {
                                if let Err(e) = file.write(&plain).await {
                                    local_error = Some(e.to_string());
                                }
                            }
                        }
                        Err(e) => local_error = Some(e.to_string()),
                    }
                }
                Message::FileComplete(complete) if complete.path == header.path => {
                    if complete.chunks != expected_index {
                        return Err(Error::protocol(format!(
                            "'{}' completed with {} chunks, received {}",
                            header.path, complete.chunks, expected_index
                        )));
                    }
                    break;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "Unexpected {} while receiving '{}'",
                        other.message_type(),
                        header.path
                    )))
                }
            }
        }

        Ok(match (partial, local_error) {
            (Some(partial), None) => Ok((partial, hasher.finalize())),
            (_, Some(reason)) => Err(reason),
            (None, None) => Err("temporary file unavailable".to_string()),
        })
    }

    /// Move the verified file into place.
    ///
    /// Keep-both renames never land on an existing file; a taken name gets
    /// the next free counter instead.
    async fn commit(
        &self,
        download: &Download,
        header: &FileHeader,
        target: &Path,
        partial: PartialFile,
    ) -> Result<()> {
        let root = self.local.root();

        if let Some(displace_to) = download.displace_local_to.as_deref() {
            if fs::try_exists(target).await? {
                let (relative, displaced_path) = vacant_path(root, displace_to).await?;
                fs::rename(target, &displaced_path).await?;
                info!("Kept local '{}' as '{}'", download.target_path, relative);
                if let Some(mut entry) = self.local.remove(&download.target_path).await {
                    entry.relative_path = relative;
                    self.local.upsert(entry).await;
                }
            }
        }

        let (relative, target) =
            if download.is_side_copy() && self.occupied(download, header, target).await? {
                vacant_path(root, &download.target_path).await?
            } else {
                (download.target_path.clone(), target.to_path_buf())
            };

        partial.persist(&target).await?;
        if let Err(e) = set_modified_millis(&target, header.modified_at) {
            warn!("{}", e);
        }
        if relative != download.target_path {
            info!("Stored '{}' as '{}'", download.target_path, relative);
        }

        self.local
            .upsert(FileEntry::new(
                relative,
                header.hash,
                header.size,
                header.modified_at,
            ))
            .await;
        Ok(())
    }

    /// Something other than the incoming content sits at `target`
    async fn occupied(
        &self,
        download: &Download,
        header: &FileHeader,
        target: &Path,
    ) -> Result<bool> {
        if !fs::try_exists(target).await? {
            return Ok(false);
        }
        let known = self.local.get(&download.target_path).await;
        Ok(!known.is_some_and(|entry| !entry.is_directory && entry.content_hash == header.hash))
    }

    fn abort(&mut self, error: &Error) {
        warn!("Sync with {} failed: {}", self.peer.id, error);
        if !self.file_failure_recorded {
            self.stats.errors += 1;
        }
        self.failure = Some(error.to_string());
        self.set_state(SessionState::Error);
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session with {}: {:?} -> {:?}", self.peer.id, self.state, state);
        self.state = state;
    }

    fn finish(mut self) -> SessionReport {
        self.stats.duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            "Sync with {} finished: {} downloaded, {} skipped, {} errors in {} ms",
            self.peer.id,
            self.stats.files_downloaded,
            self.stats.files_skipped,
            self.stats.errors,
            self.stats.duration_ms
        );
        SessionReport {
            peer_id: self.peer.id,
            stats: self.stats,
            tasks: self.tasks,
            delta: self.delta,
            failure: self.failure,
        }
    }
}

/// First of `relative` and its numbered variants with nothing on disk
async fn vacant_path(root: &Path, relative: &str) -> Result<(String, PathBuf)> {
    let mut candidate = relative.to_string();
    let mut counter = 0u32;
    loop {
        let path = resolve_relative(root, &candidate)?;
        if !fs::try_exists(&path).await? {
            return Ok((candidate, path));
        }
        counter += 1;
        candidate = numbered_path(relative, counter);
    }
}

/// Temporary file next to the target, removed on drop unless persisted.
///
/// The dot prefix keeps it out of manifest scans.
#[derive(Debug)]
struct PartialFile {
    path: PathBuf,
    file: Option<fs::File>,
    persisted: bool,
}

impl PartialFile {
    async fn create(target: &Path) -> Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::io(format!("'{}' has no parent", target.display())))?;
        fs::create_dir_all(parent).await?;

        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file");
        let path = parent.join(format!(".{}.lansync-{}.part", name, Uuid::new_v4().simple()));
        let file = fs::File::create(&path).await?;

        Ok(Self {
            path,
            file: Some(file),
            persisted: false,
        })
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(data).await?),
            None => Err(Error::io("temporary file already closed")),
        }
    }

    async fn persist(mut self, target: &Path) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.path, target).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        drop(self.file.take());
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove '{}': {}", self.path.display(), e);
        }
    }
}

//! Transfer bookkeeping, sync statistics and conflict policies

use crate::{Error, FileEntry, PeerId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for transfer tasks
pub type TaskId = Uuid;

/// Direction of a file transfer relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// This node serves the file
    Send,
    /// This node fetches the file
    Receive,
}

/// Lifecycle state of a transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Queued
    Pending,
    /// Bytes are moving
    Active,
    /// Verified and committed
    Completed,
    /// Aborted; retried on the next sync cycle
    Failed,
}

impl TransferState {
    /// Completed or failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Bookkeeping record for one file transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// Task id
    pub id: TaskId,
    /// Remote side of the transfer
    pub peer_id: PeerId,
    /// File being moved
    pub file_entry: FileEntry,
    /// Direction relative to this node
    pub direction: TransferDirection,
    /// Current state
    pub state: TransferState,
    /// Uncompressed bytes moved so far
    pub bytes_transferred: u64,
    /// When the task went active
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason
    pub error: Option<String>,
}

impl TransferTask {
    /// Create a pending task
    pub fn new(peer_id: impl Into<PeerId>, file_entry: FileEntry, direction: TransferDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            file_entry,
            direction,
            state: TransferState::Pending,
            bytes_transferred: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// PENDING -> ACTIVE
    pub fn start(&mut self) -> Result<()> {
        if self.state != TransferState::Pending {
            return Err(Error::sync(format!(
                "Cannot start transfer of '{}' in state {:?}",
                self.file_entry.relative_path, self.state
            )));
        }
        self.state = TransferState::Active;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Account for moved bytes
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
    }

    /// ACTIVE -> COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        if self.state != TransferState::Active {
            return Err(Error::sync(format!(
                "Cannot complete transfer of '{}' in state {:?}",
                self.file_entry.relative_path, self.state
            )));
        }
        self.state = TransferState::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Any non-terminal state -> FAILED. Terminal tasks are left untouched.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Outcome of one or more sync sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Files fetched and committed
    pub files_downloaded: u64,
    /// Uncompressed bytes committed
    pub bytes_downloaded: u64,
    /// Files the remote needs from us; it pulls them in its own session
    pub files_to_upload: u64,
    /// Paths surfaced for manual resolution
    pub conflicts: u64,
    /// Files the remote refused to serve
    pub files_skipped: u64,
    /// Failed files plus connection failures
    pub errors: u64,
    /// Paths whose transfer failed
    pub failed_paths: Vec<String>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl SyncStats {
    /// Create a new empty statistics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed file
    pub fn record_failure(&mut self, path: impl Into<String>) {
        self.errors += 1;
        self.failed_paths.push(path.into());
    }

    /// True when nothing went wrong
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    /// Merge statistics from another instance
    pub fn merge(&mut self, other: &SyncStats) {
        self.files_downloaded += other.files_downloaded;
        self.bytes_downloaded += other.bytes_downloaded;
        self.files_to_upload += other.files_to_upload;
        self.conflicts += other.conflicts;
        self.files_skipped += other.files_skipped;
        self.errors += other.errors;
        self.failed_paths.extend(other.failed_paths.iter().cloned());
        self.duration_ms += other.duration_ms;
    }
}

/// How to resolve a path whose content differs on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer modification time wins, ties go to the larger digest
    #[default]
    NewestWins,
    /// Same decision as `NewestWins`, but conflicts are only ever pulled
    HashCompare,
    /// Report the pair, change nothing
    Manual,
    /// Keep both copies, renaming the loser with a peer id suffix
    KeepBoth,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewestWins => "newest_wins",
            Self::HashCompare => "hash_compare",
            Self::Manual => "manual",
            Self::KeepBoth => "keep_both",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "newest_wins" => Ok(Self::NewestWins),
            "hash_compare" => Ok(Self::HashCompare),
            "manual" => Ok(Self::Manual),
            "keep_both" => Ok(Self::KeepBoth),
            other => Err(Error::config(format!("Unknown conflict policy: {}", other))),
        }
    }
}

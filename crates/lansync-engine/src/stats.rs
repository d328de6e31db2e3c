//! Engine statistics

use chrono::{DateTime, Utc};
use lansync_network::{ServerStatsSnapshot, SessionReport};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Totals over every session this node initiated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTotals {
    /// Sessions that ran to completion
    pub sessions_completed: u64,
    /// Sessions cut short by a connection failure
    pub sessions_failed: u64,
    /// Files committed
    pub files_synced: u64,
    /// Uncompressed bytes committed
    pub bytes_received: u64,
    /// Failed files plus failed sessions
    pub errors: u64,
    /// End of the most recent session
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by `SyncOrchestrator::get_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Loops are running
    pub running: bool,
    /// Peers in the directory, any state
    pub known_peers: usize,
    /// Alive peers within the timeout
    pub online_peers: usize,
    /// Files in the local manifest
    pub local_files: usize,
    /// Initiator side totals
    pub sessions: SessionTotals,
    /// Files acknowledged by remote initiators
    pub files_served: u64,
    /// Uncompressed bytes streamed to remote initiators
    pub bytes_sent: u64,
    /// Initiator errors plus responder errors
    pub errors: u64,
    /// Time since the node started
    pub uptime_secs: u64,
}

/// Collects session outcomes
#[derive(Debug)]
pub struct StatisticsCollector {
    totals: RwLock<SessionTotals>,
    started: RwLock<Option<Instant>>,
}

impl StatisticsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self {
            totals: RwLock::new(SessionTotals::default()),
            started: RwLock::new(None),
        }
    }

    /// Mark the node as started now
    pub async fn mark_started(&self) {
        *self.started.write().await = Some(Instant::now());
    }

    /// Mark the node as stopped
    pub async fn mark_stopped(&self) {
        *self.started.write().await = None;
    }

    /// Time since [`mark_started`](Self::mark_started)
    pub async fn uptime(&self) -> Duration {
        self.started
            .read()
            .await
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Fold one session report into the totals
    pub async fn record(&self, report: &SessionReport) {
        let mut totals = self.totals.write().await;
        if report.is_complete() {
            totals.sessions_completed += 1;
        } else {
            totals.sessions_failed += 1;
        }
        totals.files_synced += report.stats.files_downloaded;
        totals.bytes_received += report.stats.bytes_downloaded;
        totals.errors += report.stats.errors;
        totals.last_sync_at = Some(Utc::now());
    }

    /// Current totals
    pub async fn totals(&self) -> SessionTotals {
        self.totals.read().await.clone()
    }

    /// Combine session totals with responder counters
    pub async fn build(
        &self,
        running: bool,
        known_peers: usize,
        online_peers: usize,
        local_files: usize,
        server: ServerStatsSnapshot,
    ) -> EngineStats {
        let sessions = self.totals().await;
        EngineStats {
            running,
            known_peers,
            online_peers,
            local_files,
            errors: sessions.errors + server.errors,
            sessions,
            files_served: server.files_served,
            bytes_sent: server.bytes_sent,
            uptime_secs: self.uptime().await.as_secs(),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

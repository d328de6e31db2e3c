//! Sync orchestrator for LanSync nodes
//!
//! This crate ties the other LanSync crates into a running node.
//!
//! # Features
//!
//! - **Lifecycle**: `start` binds sockets and spawns the loops, `stop` says goodbye and drains
//! - **Discovery loops**: announce, receive, heartbeat and reaper
//! - **Sync operations**: `sync_with_peer`, `sync_with_all`, `scan_local`
//! - **Events**: a bounded, typed channel that never blocks the loops
//! - **Statistics**: initiator and responder counters in one snapshot
//!
//! # Examples
//!
//! ```rust,no_run
//! use lansync_config::Config;
//! use lansync_engine::SyncOrchestrator;
//!
//! # async fn example() -> lansync_types::Result<()> {
//! let node = SyncOrchestrator::with_config(Config::default())?;
//! node.start().await?;
//! let results = node.sync_with_all().await;
//! for (peer, stats) in results {
//!     println!("{}: {} files", peer, stats.files_downloaded);
//! }
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod events;
pub mod identity;
pub mod orchestrator;
pub mod stats;

pub use events::{EventSink, SyncEvent};
pub use identity::{derive_node_id, local_hostname, NodeIdentity, NODE_ID_LEN};
pub use orchestrator::SyncOrchestrator;
pub use stats::{EngineStats, SessionTotals, StatisticsCollector};

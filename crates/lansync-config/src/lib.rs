//! Configuration management for LanSync nodes
//!
//! Configuration is layered: built-in defaults, then an optional YAML, TOML
//! or JSON file, then `LANSYNC__SECTION__KEY` environment variables.
//!
//! # Features
//!
//! - **Multiple formats**: YAML, TOML and JSON files, detected by extension
//! - **Validation**: cross-field checks run after every build
//! - **Environment overrides**: any key can be overridden from the environment
//! - **Defaults**: a node runs with no configuration file at all
//!
//! # Examples
//!
//! ```rust
//! use lansync_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .build()
//!     .expect("defaults are valid");
//!
//! assert_eq!(config.transfer.chunk_size, 64 * 1024);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use lansync_types::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LANSYNC";

/// Main configuration structure for a LanSync node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and sync root
    pub node: NodeConfig,
    /// Multicast discovery
    pub discovery: DiscoveryConfig,
    /// TCP transfer channel
    pub transfer: TransferConfig,
    /// Sync behaviour
    pub sync: SyncConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.transfer.chunk_size < 1024 {
            return Err(ConfigError::validation(
                "Chunk size must be at least 1024 bytes",
            ));
        }

        if self.transfer.compression_level > 9 {
            return Err(ConfigError::validation(
                "Compression level must be between 0 and 9",
            ));
        }

        // A chunk can grow slightly under deflate, leave headroom
        if self.transfer.max_frame_size < self.transfer.chunk_size + 1024 {
            return Err(ConfigError::validation(
                "Max frame size must exceed chunk size by at least 1024 bytes",
            ));
        }

        if self.discovery.port != 0 && self.discovery.port == self.transfer.port {
            return Err(ConfigError::validation(
                "Discovery and transfer ports must differ",
            ));
        }

        if !self.discovery.multicast_group.is_multicast() {
            return Err(ConfigError::invalid_value(
                "discovery.multicast_group",
                "not a multicast address",
            ));
        }

        if self.discovery.heartbeat_interval_ms == 0 || self.discovery.announce_interval_ms == 0 {
            return Err(ConfigError::validation(
                "Discovery intervals must be greater than 0",
            ));
        }

        if self.discovery.heartbeat_interval_ms >= self.discovery.peer_timeout_ms {
            return Err(ConfigError::validation(
                "Heartbeat interval must be shorter than the peer timeout",
            ));
        }

        if self.sync.event_buffer == 0 {
            return Err(ConfigError::validation(
                "Event buffer must be greater than 0",
            ));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

/// Node identity and sync root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Overrides the fingerprint-derived node id
    pub id: Option<String>,
    /// Defaults to the host name
    pub display_name: Option<String>,
    /// Directory kept in sync
    pub sync_root: PathBuf,
    /// Logical roots advertised to peers
    pub shared_folders: Vec<String>,
    /// Glob patterns excluded from manifests
    pub exclude: Vec<String>,
    /// Emit directory entries in manifests
    pub track_directories: bool,
    /// Reuse hashes when size and mtime are unchanged
    pub fast_rescan: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            display_name: None,
            sync_root: PathBuf::from("sync"),
            shared_folders: vec!["default".to_string()],
            exclude: vec!["*.tmp".to_string(), "*.swp".to_string()],
            track_directories: false,
            fast_rescan: false,
        }
    }
}

/// Multicast discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run the discovery loops
    pub enabled: bool,
    /// Multicast group
    pub multicast_group: Ipv4Addr,
    /// Discovery UDP port
    pub port: u16,
    /// Local interface used to join the group
    pub interface: Ipv4Addr,
    /// ANNOUNCE cadence
    pub announce_interval_ms: u64,
    /// HEARTBEAT and reaper cadence
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer goes stale
    pub peer_timeout_ms: u64,
    /// Silence after which a stale peer is dropped
    pub reap_after_ms: u64,
    /// Receive our own multicast datagrams (they are discarded by id)
    pub multicast_loop: bool,
    /// Multicast TTL; 1 keeps traffic on the local segment
    pub multicast_ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let announce_interval_ms = 10_000;
        let heartbeat_interval_ms = announce_interval_ms / 2;
        Self {
            enabled: true,
            multicast_group: Ipv4Addr::new(239, 255, 42, 99),
            port: 42420,
            interface: Ipv4Addr::UNSPECIFIED,
            announce_interval_ms,
            heartbeat_interval_ms,
            peer_timeout_ms: heartbeat_interval_ms * 3,
            reap_after_ms: 60_000,
            multicast_loop: true,
            multicast_ttl: 1,
        }
    }
}

impl DiscoveryConfig {
    /// ANNOUNCE cadence
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// HEARTBEAT cadence
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Peer timeout
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Stale peer retention
    pub fn reap_after(&self) -> Duration {
        Duration::from_millis(self.reap_after_ms)
    }

    /// Multicast destination
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_group, self.port))
    }
}

/// TCP transfer channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Listener address
    pub bind_addr: IpAddr,
    /// Listener port
    pub port: u16,
    /// Uncompressed bytes per chunk
    pub chunk_size: usize,
    /// zlib level, 0 disables compression
    pub compression_level: u32,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
    /// Connect timeout
    pub connect_timeout_ms: u64,
    /// Per-frame read timeout
    pub read_timeout_ms: u64,
    /// How long in-flight sessions may run after stop
    pub shutdown_grace_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 42421,
            chunk_size: 64 * 1024,
            compression_level: 6,
            max_frame_size: 16 * 1024 * 1024,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TransferConfig {
    /// Listener socket address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Sync behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Conflict resolution policy
    pub conflict_policy: ConflictPolicy,
    /// Periodic sync with all peers, 0 disables
    pub auto_sync_interval_ms: u64,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::NewestWins,
            auto_sync_interval_ms: 0,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Auto-sync cadence, `None` when disabled
    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_ms > 0).then(|| Duration::from_millis(self.auto_sync_interval_ms))
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

use lansync_config::Config;
use lansync_engine::SyncOrchestrator;
use lansync_network::{Envelope, HeartbeatInfo, Message, PeerInfo};
use lansync_sync::set_modified_millis;
use lansync_types::Result;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// A fixed timestamp used as "old" content, 2020-09-13
pub const BASE_MTIME: i64 = 1_600_000_000_000;

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros, compresses to almost nothing
    Zeros,
    /// Repeating printable text
    Text,
    /// Deterministic noise that zlib cannot shrink
    Noise,
}

/// Generate `size` bytes following `pattern`
pub fn generate_test_data(size: usize, pattern: TestDataPattern) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Text => b"the quick brown fox jumps over the lazy dog\n"
            .iter()
            .copied()
            .cycle()
            .take(size)
            .collect(),
        TestDataPattern::Noise => {
            // xorshift64, seeded so every run sees the same bytes
            let mut state = 0x9E37_79B9_7F4A_7C15u64;
            (0..size)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 24) as u8
                })
                .collect()
        }
    }
}

/// Write `data` under `root` and pin its modification time
pub fn write_file(root: &Path, relative: &str, data: &[u8], modified_at: i64) -> Result<PathBuf> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, data)?;
    set_modified_millis(&path, modified_at)?;
    Ok(path)
}

/// Loopback-only node configuration with discovery disabled
pub fn node_config(root: &Path, id: &str) -> Config {
    let mut config = Config::default();
    config.node.id = Some(id.to_string());
    config.node.display_name = Some(id.to_string());
    config.node.sync_root = root.to_path_buf();
    config.discovery.enabled = false;
    config.transfer.bind_addr = Ipv4Addr::LOCALHOST.into();
    config.transfer.port = 0;
    config.transfer.connect_timeout_ms = 2_000;
    config.transfer.read_timeout_ms = 5_000;
    config.transfer.shutdown_grace_ms = 1_000;
    config
}

/// Build and start a node rooted at `root`
pub async fn start_node(root: &Path, id: &str) -> Result<SyncOrchestrator> {
    let node = SyncOrchestrator::with_config(node_config(root, id))?;
    node.start().await?;
    Ok(node)
}

/// Feed `node` an announce and a heartbeat from `peer_id`, leaving it alive
/// at `127.0.0.1:transfer_port`
pub async fn introduce(node: &SyncOrchestrator, peer_id: &str, transfer_port: u16) -> Result<()> {
    let source = SocketAddr::from((Ipv4Addr::LOCALHOST, 42420));
    let info = PeerInfo::new(peer_id, transfer_port, vec!["default".to_string()]);

    let announce = Envelope::seal(peer_id, &Message::Announce(info))?;
    node.handle_discovery(&announce, source).await?;
    let heartbeat = Envelope::seal(
        peer_id,
        &Message::Heartbeat(HeartbeatInfo { transfer_port }),
    )?;
    node.handle_discovery(&heartbeat, source).await?;
    Ok(())
}

/// Make `a` and `b` see each other as alive
pub async fn introduce_both(a: &SyncOrchestrator, b: &SyncOrchestrator) -> Result<()> {
    let a_port = transfer_port(a).await;
    let b_port = transfer_port(b).await;
    introduce(a, b.node_id(), b_port).await?;
    introduce(b, a.node_id(), a_port).await
}

/// Port of a started node's transfer listener, 0 if it is not running
pub async fn transfer_port(node: &SyncOrchestrator) -> u16 {
    node.transfer_addr().await.map_or(0, |addr| addr.port())
}

/// Every file under `root` whose name marks it as an unfinished download
pub fn partial_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "part") {
                found.push(path);
            }
        }
    }
    found
}

//! Node identity

use lansync_config::NodeConfig;
use std::path::Path;

/// Hex characters kept from the fingerprint digest
pub const NODE_ID_LEN: usize = 16;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// How this node names itself on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Stable id used as envelope sender
    pub id: String,
    /// Human readable name
    pub display_name: String,
}

impl NodeIdentity {
    /// Identity from configuration, falling back to a host fingerprint
    pub fn resolve(node: &NodeConfig) -> Self {
        let hostname = local_hostname();
        let id = match node.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => derive_node_id(&hostname, read_machine_id().as_deref(), &node.sync_root),
        };
        let display_name = node
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(hostname);

        Self { id, display_name }
    }
}

/// Fingerprint of host, machine and sync root.
///
/// Two nodes on one host syncing different roots get different ids.
pub fn derive_node_id(hostname: &str, machine_id: Option<&str>, sync_root: &Path) -> String {
    let root = std::fs::canonicalize(sync_root).unwrap_or_else(|_| sync_root.to_path_buf());

    let mut hasher = blake3::Hasher::new();
    hasher.update(hostname.as_bytes());
    hasher.update(&[0]);
    if let Some(machine_id) = machine_id {
        hasher.update(machine_id.as_bytes());
    }
    hasher.update(&[0]);
    hasher.update(root.to_string_lossy().as_bytes());

    let mut id = hex::encode(hasher.finalize().as_bytes());
    id.truncate(NODE_ID_LEN);
    id
}

/// Host name, or `lansync` when it cannot be read
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "lansync".to_string())
}

fn read_machine_id() -> Option<String> {
    std::fs::read_to_string(MACHINE_ID_PATH)
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_node_id_is_stable_and_short() {
        let root = PathBuf::from("/nonexistent/lansync-root");
        let a = derive_node_id("desk", Some("abc"), &root);
        let b = derive_node_id("desk", Some("abc"), &root);
        assert_eq!(a, b);
        assert_eq!(a.len(), NODE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_node_id_depends_on_every_input() {
        let root = PathBuf::from("/nonexistent/one");
        let base = derive_node_id("desk", Some("abc"), &root);
        assert_ne!(base, derive_node_id("laptop", Some("abc"), &root));
        assert_ne!(base, derive_node_id("desk", None, &root));
        assert_ne!(base, derive_node_id("desk", Some("abc"), Path::new("/nonexistent/two")));
    }

    #[test]
    fn test_configured_identity_wins() {
        let node = NodeConfig {
            id: Some("node-a".to_string()),
            display_name: Some("Desk".to_string()),
            ..NodeConfig::default()
        };
        let identity = NodeIdentity::resolve(&node);
        assert_eq!(identity.id, "node-a");
        assert_eq!(identity.display_name, "Desk");
    }

    #[test]
    fn test_blank_overrides_fall_back() {
        let node = NodeConfig {
            id: Some("  ".to_string()),
            display_name: Some(String::new()),
            ..NodeConfig::default()
        };
        let identity = NodeIdentity::resolve(&node);
        assert_eq!(identity.id.len(), NODE_ID_LEN);
        assert_eq!(identity.display_name, local_hostname());
    }
}

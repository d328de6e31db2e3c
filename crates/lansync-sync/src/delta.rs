//! Delta calculation between a local and a remote manifest
//!
//! [`DeltaCalculator::compute`] is a pure function of the two manifests,
//! the conflict policy and the two node ids. It never touches the disk.

use lansync_types::{ConflictPolicy, ContentHash, FileEntry, Manifest, PeerId};
use serde::{Deserialize, Serialize};

/// Number of peer id characters used in keep-both file names
pub const CONFLICT_SUFFIX_LEN: usize = 8;

/// A remote file this node should fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    /// Remote entry, `relative_path` is what to request from the peer
    pub remote: FileEntry,
    /// Where to store the received content
    pub target_path: String,
    /// Move the existing local file here before writing `target_path`
    pub displace_local_to: Option<String>,
}

impl Download {
    fn plain(remote: FileEntry) -> Self {
        Self {
            target_path: remote.relative_path.clone(),
            remote,
            displace_local_to: None,
        }
    }

    /// The content is stored beside the local file rather than over it
    pub fn is_side_copy(&self) -> bool {
        self.displace_local_to.is_none() && self.target_path != self.remote.relative_path
    }
}

/// Both sides changed a path and the policy did not pick a side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Local version
    pub local: FileEntry,
    /// Remote version
    pub remote: FileEntry,
}

/// What it takes to bring two manifests into agreement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Files to fetch from the peer
    pub to_download: Vec<Download>,
    /// Files the peer should fetch from us
    pub to_upload: Vec<FileEntry>,
    /// Unresolved conflicts
    pub conflicts: Vec<Conflict>,
}

impl Delta {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_upload.is_empty() && self.conflicts.is_empty()
    }

    /// Paths to download, in request order
    pub fn download_paths(&self) -> Vec<String> {
        self.to_download
            .iter()
            .map(|d| d.remote.relative_path.clone())
            .collect()
    }

    /// Paths the peer should pull
    pub fn upload_paths(&self) -> Vec<String> {
        self.to_upload.iter().map(|e| e.relative_path.clone()).collect()
    }

    /// Conflicting paths
    pub fn conflict_paths(&self) -> Vec<String> {
        self.conflicts
            .iter()
            .map(|c| c.local.relative_path.clone())
            .collect()
    }
}

/// Compares manifests under a conflict policy
#[derive(Debug, Clone)]
pub struct DeltaCalculator {
    policy: ConflictPolicy,
    local_id: PeerId,
    remote_id: PeerId,
}

impl DeltaCalculator {
    /// Create a calculator; peer ids default to `local` and `remote`
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            local_id: "local".to_string(),
            remote_id: "remote".to_string(),
        }
    }

    /// Node ids used for keep-both suffixes
    pub fn with_peers(mut self, local_id: impl Into<PeerId>, remote_id: impl Into<PeerId>) -> Self {
        self.local_id = local_id.into();
        self.remote_id = remote_id.into();
        self
    }

    /// Policy in use
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Compute the delta from this node's point of view
    pub fn compute(&self, local: &Manifest, remote: &Manifest) -> Delta {
        let mut delta = Delta::default();

        for remote_entry in remote {
            match local.get(&remote_entry.relative_path) {
                None => delta.to_download.push(Download::plain(remote_entry.clone())),
                Some(local_entry) => self.resolve(local, local_entry, remote_entry, &mut delta),
            }
        }

        for local_entry in local {
            if !remote.contains(&local_entry.relative_path) {
                delta.to_upload.push(local_entry.clone());
            }
        }

        delta
    }

    fn resolve(
        &self,
        manifest: &Manifest,
        local: &FileEntry,
        remote: &FileEntry,
        delta: &mut Delta,
    ) {
        if local.is_directory != remote.is_directory {
            // A file and a directory cannot share a path
            delta.conflicts.push(Conflict {
                local: local.clone(),
                remote: remote.clone(),
            });
            return;
        }

        if local.is_identical(remote) {
            return;
        }

        let remote_wins = remote_wins(local, remote);
        match self.policy {
            ConflictPolicy::NewestWins => {
                if remote_wins {
                    delta.to_download.push(Download::plain(remote.clone()));
                } else {
                    delta.to_upload.push(local.clone());
                }
            }
            ConflictPolicy::HashCompare => {
                if remote_wins {
                    delta.to_download.push(Download::plain(remote.clone()));
                }
            }
            ConflictPolicy::Manual => delta.conflicts.push(Conflict {
                local: local.clone(),
                remote: remote.clone(),
            }),
            ConflictPolicy::KeepBoth => {
                if remote_wins {
                    let displaced = conflict_path(&local.relative_path, &self.local_id);
                    delta.to_download.push(Download {
                        remote: remote.clone(),
                        target_path: remote.relative_path.clone(),
                        displace_local_to: free_path(manifest, &displaced, None),
                    });
                    return;
                }
                let copy = conflict_path(&remote.relative_path, &self.remote_id);
                // Already holding the remote version beside ours
                if let Some(target_path) = free_path(manifest, &copy, Some(&remote.content_hash)) {
                    delta.to_download.push(Download {
                        remote: remote.clone(),
                        target_path,
                        displace_local_to: None,
                    });
                }
            }
        }
    }
}

/// Free-function form of [`DeltaCalculator::compute`]
pub fn compute_delta(local: &Manifest, remote: &Manifest, policy: ConflictPolicy) -> Delta {
    DeltaCalculator::new(policy).compute(local, remote)
}

/// Newer mtime wins; equal mtimes go to the larger digest
fn remote_wins(local: &FileEntry, remote: &FileEntry) -> bool {
    match remote.modified_at.cmp(&local.modified_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => remote.content_hash > local.content_hash,
    }
}

/// First of `base` and its numbered variants not present in `manifest`.
///
/// Returns `None` when a candidate already holds `hash`.
fn free_path(manifest: &Manifest, base: &str, hash: Option<&ContentHash>) -> Option<String> {
    let mut candidate = base.to_string();
    let mut counter = 0u32;
    loop {
        match manifest.get(&candidate) {
            None => return Some(candidate),
            Some(existing) if !existing.is_directory && Some(&existing.content_hash) == hash => {
                return None
            }
            Some(_) => {
                counter += 1;
                candidate = numbered_path(base, counter);
            }
        }
    }
}

/// `dir/name.ext` -> `dir/name.<peer8>.ext`
pub fn conflict_path(relative_path: &str, peer_id: &str) -> String {
    let suffix: String = peer_id.chars().take(CONFLICT_SUFFIX_LEN).collect();
    insert_suffix(relative_path, &suffix)
}

/// `dir/name.ext` -> `dir/name.<counter>.ext`, used when a keep-both name is taken
pub fn numbered_path(relative_path: &str, counter: u32) -> String {
    insert_suffix(relative_path, &counter.to_string())
}

fn insert_suffix(relative_path: &str, suffix: &str) -> String {
    let (dir, name) = match relative_path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, relative_path),
    };

    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{}.{}", stem, suffix, ext),
        _ => format!("{}.{}", name, suffix),
    };

    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}

//! Manifest building and the shared local manifest
//!
//! [`ManifestBuilder`] walks a sync root and hashes every regular file.
//! [`LocalManifest`] owns the node's current manifest; sessions work on
//! snapshots so no lock is held across network or disk I/O.

use crate::cache::{CacheStats, FileStamp, HashCache};
use crate::hasher::hash_file;
use lansync_types::{Error, FileEntry, Manifest, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Options controlling what ends up in a manifest
#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// Glob patterns matched against `/`-separated relative paths
    pub exclude: Vec<String>,
    /// Emit entries for directories
    pub track_directories: bool,
    /// Reuse digests when size, mtime and change time are unchanged
    pub fast_rescan: bool,
}

/// A filesystem object found by the walk, not yet hashed
#[derive(Debug)]
struct Candidate {
    relative_path: String,
    absolute_path: PathBuf,
    stamp: FileStamp,
    is_directory: bool,
}

/// Walks a sync root and produces a [`Manifest`]
#[derive(Debug)]
pub struct ManifestBuilder {
    root: PathBuf,
    exclude: Vec<glob::Pattern>,
    track_directories: bool,
    cache: Option<HashCache>,
}

impl ManifestBuilder {
    /// Create a builder for `root`
    pub fn new(root: impl Into<PathBuf>, options: ManifestOptions) -> Result<Self> {
        let exclude = options
            .exclude
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| {
                    Error::config(format!("Invalid exclude pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: root.into(),
            exclude,
            track_directories: options.track_directories,
            cache: options.fast_rescan.then(HashCache::new),
        })
    }

    /// Sync root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash cache counters, `None` when fast rescan is off
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(HashCache::stats)
    }

    /// Whether `relative_path` matches an exclude pattern
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        is_excluded(&self.exclude, relative_path)
    }

    /// Full rescan of the sync root.
    ///
    /// Files that cannot be read are logged and left out; the scan goes on.
    pub async fn build(&mut self) -> Result<Manifest> {
        let root = self.root.clone();
        if !root.is_dir() {
            return Err(Error::FileNotFound { path: root });
        }

        let exclude = self.exclude.clone();
        let track_directories = self.track_directories;
        let candidates = tokio::task::spawn_blocking(move || {
            collect_candidates(&root, &exclude, track_directories)
        })
        .await
        .map_err(|e| Error::other(format!("Manifest walk task failed: {}", e)))?;

        let mut manifest = Manifest::new();
        let mut skipped = 0usize;
        for candidate in candidates {
            if candidate.is_directory {
                manifest.insert(FileEntry::directory(
                    candidate.relative_path,
                    candidate.stamp.modified_at,
                ));
                continue;
            }

            let cached = self
                .cache
                .as_mut()
                .and_then(|cache| cache.get(&candidate.relative_path, &candidate.stamp));

            let hash = match cached {
                Some(hash) => hash,
                None => match hash_file(&candidate.absolute_path).await {
                    Ok(hash) => {
                        if let Some(cache) = self.cache.as_mut() {
                            cache.store(candidate.relative_path.clone(), candidate.stamp, hash);
                        }
                        hash
                    }
                    Err(e) => {
                        warn!("Skipping unreadable file '{}': {}", candidate.relative_path, e);
                        skipped += 1;
                        continue;
                    }
                },
            };

            manifest.insert(FileEntry::new(
                candidate.relative_path,
                hash,
                candidate.stamp.size,
                candidate.stamp.modified_at,
            ));
        }

        if let Some(cache) = self.cache.as_mut() {
            let live: HashSet<String> = manifest.paths().cloned().collect();
            cache.retain_paths(&live);
            let stats = cache.stats();
            debug!(
                "Hash cache: {} hits, {} misses, {} entries",
                stats.hits, stats.misses, stats.entries
            );
        }

        info!(
            "Scanned {}: {} files, {} bytes, {} skipped",
            self.root.display(),
            manifest.file_count(),
            manifest.total_bytes(),
            skipped
        );

        Ok(manifest)
    }
}

fn is_excluded(patterns: &[glob::Pattern], relative_path: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(relative_path))
}

fn collect_candidates(
    root: &Path,
    exclude: &[glob::Pattern],
    track_directories: bool,
) -> Vec<Candidate> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                return false;
            }
            match relative_path_of(root, entry.path()) {
                Some(relative) => !is_excluded(exclude, &relative),
                None => false,
            }
        });

    let mut candidates = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let file_type = entry.file_type();
        let is_directory = file_type.is_dir();
        if !file_type.is_file() && !(is_directory && track_directories) {
            continue;
        }

        let Some(relative_path) = relative_path_of(root, entry.path()) else {
            warn!("Skipping non UTF-8 path: {}", entry.path().display());
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping '{}': {}", relative_path, e);
                continue;
            }
        };

        let size = if is_directory { 0 } else { metadata.len() };
        let modified_at = metadata.modified().map(system_time_to_millis).unwrap_or(0);
        candidates.push(Candidate {
            relative_path,
            absolute_path: entry.path().to_path_buf(),
            stamp: FileStamp::from_metadata(size, modified_at, &metadata),
            is_directory,
        });
    }
    candidates
}

/// `/`-separated path of `path` below `root`, `None` outside the root or for
/// non UTF-8 names
pub fn relative_path_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Resolve a peer-supplied relative path below `root`.
///
/// Absolute paths, `..` components and dot-prefixed names are refused.
pub fn resolve_relative(root: &Path, relative_path: &str) -> Result<PathBuf> {
    if relative_path.is_empty() {
        return Err(Error::protocol("Empty relative path"));
    }

    let mut resolved = root.to_path_buf();
    for part in relative_path.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.starts_with('.') {
            return Err(Error::protocol(format!(
                "Refusing unsafe path '{}'",
                relative_path
            )));
        }
        if Path::new(part).components().count() != 1
            || !matches!(Path::new(part).components().next(), Some(Component::Normal(_)))
        {
            return Err(Error::protocol(format!(
                "Refusing unsafe path '{}'",
                relative_path
            )));
        }
        resolved.push(part);
    }
    Ok(resolved)
}

/// Milliseconds since the Unix epoch
pub fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Set a file's modification time from epoch milliseconds
pub fn set_modified_millis(path: &Path, modified_at: i64) -> Result<()> {
    let time = if modified_at >= 0 {
        UNIX_EPOCH + Duration::from_millis(modified_at as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(modified_at.unsigned_abs())
    };
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(time)).map_err(|e| {
        Error::Io {
            message: format!("Failed to set mtime on '{}': {}", path.display(), e),
        }
    })
}

/// The node's manifest, shared between rescans and sync sessions
#[derive(Debug)]
pub struct LocalManifest {
    root: PathBuf,
    current: RwLock<Manifest>,
    builder: Mutex<ManifestBuilder>,
}

impl LocalManifest {
    /// Wrap a builder; the manifest starts empty until [`rescan`](Self::rescan)
    pub fn new(builder: ManifestBuilder) -> Self {
        Self {
            root: builder.root().to_path_buf(),
            current: RwLock::new(Manifest::new()),
            builder: Mutex::new(builder),
        }
    }

    /// Sync root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild from disk, returns the number of files
    pub async fn rescan(&self) -> Result<usize> {
        // Concurrent rescans queue here; readers keep the old manifest meanwhile
        let mut builder = self.builder.lock().await;
        let manifest = builder.build().await?;
        let count = manifest.file_count();
        *self.current.write().await = manifest;
        Ok(count)
    }

    /// Copy of the current manifest
    pub async fn snapshot(&self) -> Manifest {
        self.current.read().await.clone()
    }

    /// Look up one entry
    pub async fn get(&self, path: &str) -> Option<FileEntry> {
        self.current.read().await.get(path).cloned()
    }

    /// Record a file written by a sync session
    pub async fn upsert(&self, entry: FileEntry) {
        self.current.write().await.insert(entry);
    }

    /// Forget a path (e.g. a file displaced by a keep-both rename)
    pub async fn remove(&self, path: &str) -> Option<FileEntry> {
        self.current.write().await.remove(path)
    }

    /// Number of files in the current manifest
    pub async fn file_count(&self) -> usize {
        self.current.read().await.file_count()
    }

    /// Whether `relative_path` would be left out of a scan
    pub async fn is_excluded(&self, relative_path: &str) -> bool {
        self.builder.lock().await.is_excluded(relative_path)
    }
}

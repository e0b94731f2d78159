//! On-disk layout of the cache root.
//!
//! ```text
//! <root>/<hash>/            published install
//! <root>/<hash>/.ready      readiness marker (JSON)
//! <root>/.leases/<hash>.lease
//! <root>/.tmp/<hash>-<ulid>/
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use orchestrator_core::{DependencyHash, DependencySpec};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::CacheError;

pub(crate) const MARKER: &str = ".ready";
const LEASES: &str = ".leases";
const TMP: &str = ".tmp";

/// Written last into an install directory; its presence means "complete".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub dependency_hash: DependencyHash,
    pub dependencies: DependencySpec,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn init(&self) -> Result<(), CacheError> {
        fs::create_dir_all(self.lease_dir()).await?;
        fs::create_dir_all(self.tmp_dir()).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, hash: &DependencyHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    pub fn marker_path(&self, hash: &DependencyHash) -> PathBuf {
        self.entry_dir(hash).join(MARKER)
    }

    pub fn lease_dir(&self) -> PathBuf {
        self.root.join(LEASES)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP)
    }

    /// A fresh, unique staging directory for `hash`.
    pub fn new_tmp(&self, hash: &DependencyHash) -> PathBuf {
        self.tmp_dir().join(format!("{}-{}", hash, Ulid::new()))
    }

    /// Hash a staging directory belongs to, from its name.
    pub fn tmp_owner(name: &str) -> Option<DependencyHash> {
        let (hash, suffix) = name.rsplit_once('-')?;
        (Ulid::from_string(suffix).is_ok() && DependencyHash::is_well_formed(hash))
            .then(|| DependencyHash::from(hash))
    }

    pub async fn is_published(&self, hash: &DependencyHash) -> bool {
        fs::try_exists(self.marker_path(hash)).await.unwrap_or(false)
    }

    /// Read the marker of a published entry. `None` if absent or unreadable.
    pub async fn read_marker(&self, hash: &DependencyHash) -> Option<ReadyMarker> {
        let bytes = fs::read(self.marker_path(hash)).await.ok()?;
        let marker: ReadyMarker = serde_json::from_slice(&bytes).ok()?;
        (marker.dependency_hash == *hash).then_some(marker)
    }

    /// Hash-named directories directly under the root.
    pub async fn entry_dirs(&self) -> Result<Vec<DependencyHash>, CacheError> {
        let mut hashes = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if DependencyHash::is_well_formed(&name) {
                hashes.push(DependencyHash::from(name.as_str()));
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Staging directories with the hash that owns each.
    pub async fn tmp_dirs(&self) -> Result<Vec<(PathBuf, Option<DependencyHash>)>, CacheError> {
        let mut dirs = Vec::new();
        let mut entries = match fs::read_dir(self.tmp_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            dirs.push((entry.path(), Self::tmp_owner(&name)));
        }
        Ok(dirs)
    }

    /// Empty the whole root and recreate the bookkeeping directories.
    pub async fn purge(&self) -> Result<(), CacheError> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            remove_path(&entry.path()).await?;
        }
        self.init().await
    }
}

/// Write `marker` into `dir` atomically.
pub(crate) async fn write_marker(dir: &Path, marker: &ReadyMarker) -> Result<(), CacheError> {
    let json = serde_json::to_vec_pretty(marker)?;
    write_atomic(&dir.join(MARKER), &json).await
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let temp_path = path.with_extension(format!("{}.tmp", Ulid::new()));
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Remove a file or directory tree; missing paths are fine.
pub(crate) async fn remove_path(path: &Path) -> Result<(), CacheError> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

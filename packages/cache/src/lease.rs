//! Hash-scoped exclusive leases backed by files in `<root>/.leases/`.
//!
//! A lease is acquired by creating `<hash>.lease` with `create_new`, so at
//! most one holder exists across every process sharing the cache volume.
//! Holders renew the expiry while they work. A lease whose
//! `expires_at + grace` has passed belongs to a dead holder and may be
//! reclaimed by anyone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_core::DependencyHash;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::CacheError;
use crate::layout::write_atomic;

const EXTENSION: &str = "lease";

/// Contents of a lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        self.expires_at
            .checked_add_signed(grace)
            .is_some_and(|deadline| deadline < now)
    }
}

/// What a lease file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Held(LeaseRecord),
    Stale(LeaseRecord),
    /// Present but undecodable, e.g. torn by a crash mid-write.
    Unreadable { modified: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    ttl: Duration,
    grace: Duration,
}

/// Proof of holding a lease. Dropping it without [`LeaseGuard::release`]
/// still removes the file if it is ours.
#[derive(Debug)]
pub struct LeaseGuard {
    hash: DependencyHash,
    path: PathBuf,
    holder: String,
    acquired_at: DateTime<Utc>,
    released: bool,
}

impl LeaseGuard {
    pub fn hash(&self) -> &DependencyHash {
        &self.hash
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Give the lease up, removing the file if we still own it.
    pub async fn release(mut self) {
        self.released = true;
        match read_record(&self.path).await {
            Ok(Some(record)) if record.holder == self.holder => {
                if let Err(e) = fs::remove_file(&self.path).await {
                    tracing::warn!(hash = %self.hash, error = %e, "Failed to remove lease file");
                }
            }
            Ok(_) => {
                tracing::warn!(hash = %self.hash, "Lease was taken over before release");
            }
            Err(e) => {
                tracing::warn!(hash = %self.hash, error = %e, "Failed to read lease on release");
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok())
            .is_some_and(|record| record.holder == self.holder);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl LeaseManager {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, grace: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            grace,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn path_for(&self, hash: &DependencyHash) -> PathBuf {
        self.dir.join(format!("{}.{}", hash, EXTENSION))
    }

    fn record(&self, holder: String, acquired_at: DateTime<Utc>) -> LeaseRecord {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        LeaseRecord {
            holder,
            acquired_at,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Try to take the lease. `None` if someone else holds the file.
    pub async fn try_acquire(&self, hash: &DependencyHash) -> Result<Option<LeaseGuard>, CacheError> {
        let path = self.path_for(hash);
        let holder = Ulid::new().to_string();
        let acquired_at = Utc::now();

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let guard = LeaseGuard {
            hash: hash.clone(),
            path,
            holder: holder.clone(),
            acquired_at,
            released: false,
        };
        let json = serde_json::to_vec(&self.record(holder, acquired_at))?;
        file.write_all(&json).await?;
        file.sync_all().await?;

        tracing::debug!(hash = %hash, holder = %guard.holder, "Lease acquired");
        Ok(Some(guard))
    }

    /// Push the expiry of a held lease forward.
    pub async fn renew(&self, guard: &LeaseGuard) -> Result<(), CacheError> {
        match read_record(&guard.path).await? {
            Some(record) if record.holder == guard.holder => {
                let renewed = self.record(guard.holder.clone(), guard.acquired_at);
                write_atomic(&guard.path, &serde_json::to_vec(&renewed)?).await
            }
            _ => Err(CacheError::LeaseLost(guard.hash.clone())),
        }
    }

    pub async fn state(&self, hash: &DependencyHash) -> Result<LeaseState, CacheError> {
        self.state_at(&self.path_for(hash)).await
    }

    async fn state_at(&self, path: &Path) -> Result<LeaseState, CacheError> {
        match read_record(path).await {
            Ok(None) => Ok(LeaseState::Free),
            Ok(Some(record)) if record.is_stale(Utc::now(), self.grace) => {
                Ok(LeaseState::Stale(record))
            }
            Ok(Some(record)) => Ok(LeaseState::Held(record)),
            Err(CacheError::Json(_)) => {
                let modified = fs::metadata(path)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .map(DateTime::<Utc>::from);
                Ok(LeaseState::Unreadable { modified })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a live holder exists for `hash`.
    pub async fn is_held(&self, hash: &DependencyHash) -> Result<bool, CacheError> {
        Ok(match self.state(hash).await? {
            LeaseState::Held(_) => true,
            LeaseState::Unreadable { modified } => !self.unreadable_is_abandoned(modified),
            LeaseState::Free | LeaseState::Stale(_) => false,
        })
    }

    fn unreadable_is_abandoned(&self, modified: Option<DateTime<Utc>>) -> bool {
        let window = chrono::Duration::from_std(self.ttl + self.grace).unwrap_or(chrono::Duration::MAX);
        modified
            .and_then(|m| m.checked_add_signed(window))
            .is_none_or(|deadline| deadline < Utc::now())
    }

    /// Remove the lease on `hash` if its holder is gone.
    ///
    /// The file is first renamed to a private tombstone so two reclaimers
    /// cannot both delete a lease that was re-acquired in between. If the
    /// tombstone turns out to hold a live lease it is linked back.
    pub async fn reclaim_if_stale(&self, hash: &DependencyHash) -> Result<bool, CacheError> {
        let path = self.path_for(hash);
        let observed = match self.state_at(&path).await? {
            LeaseState::Stale(record) => Some(record),
            LeaseState::Unreadable { modified } if self.unreadable_is_abandoned(modified) => None,
            _ => return Ok(false),
        };

        let tombstone = self.dir.join(format!("{}.{}.reclaimed", hash, Ulid::new()));
        match fs::rename(&path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let taken = read_record(&tombstone).await.ok().flatten();
        let still_stale = match (&observed, &taken) {
            (Some(seen), Some(now)) => seen == now,
            (None, None) => true,
            _ => false,
        };
        if !still_stale {
            // A live holder replaced the file between our read and rename
            match fs::hard_link(&tombstone, &path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "Failed to restore live lease");
                }
            }
        }
        let _ = fs::remove_file(&tombstone).await;

        if still_stale {
            tracing::info!(
                hash = %hash,
                holder = observed.as_ref().map(|r| r.holder.as_str()).unwrap_or("<unreadable>"),
                "Reclaimed stale lease"
            );
        }
        Ok(still_stale)
    }

    /// Hashes with a lease file present, plus leftover tombstones.
    pub async fn list(&self) -> Result<(Vec<DependencyHash>, Vec<PathBuf>), CacheError> {
        let mut hashes = Vec::new();
        let mut leftovers = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((hashes, leftovers)),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            match name.strip_suffix(".lease") {
                Some(hash) if DependencyHash::is_well_formed(hash) => {
                    hashes.push(DependencyHash::from(hash))
                }
                _ => leftovers.push(path),
            }
        }
        hashes.sort();
        Ok((hashes, leftovers))
    }
}

async fn read_record(path: &Path) -> Result<Option<LeaseRecord>, CacheError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

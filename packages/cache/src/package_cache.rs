//! The package cache proper.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use db::repositories::PackageRepository;
use db::{Database, DbError};
use orchestrator_core::{
    DependencyHash, DependencySpec, JobId, OrchestratorEvent, PackageEntry, PackageState,
};
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::layout::{CacheLayout, ReadyMarker, remove_path, write_marker};
use crate::lease::{LeaseGuard, LeaseManager};
use crate::{CacheConfig, CacheError, PackageInstaller};

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Repairs made by one [`PackageCache::reconcile`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheRepairReport {
    pub reclaimed_leases: Vec<DependencyHash>,
    pub removed_leftovers: usize,
    pub removed_staging: usize,
    pub dropped_rows: Vec<DependencyHash>,
    pub adopted: Vec<DependencyHash>,
    pub removed_dirs: Vec<DependencyHash>,
    /// The index could not be decoded; the cache is now unhealthy.
    pub index_corrupt: bool,
}

impl CacheRepairReport {
    pub fn repairs(&self) -> usize {
        self.reclaimed_leases.len()
            + self.removed_leftovers
            + self.removed_staging
            + self.dropped_rows.len()
            + self.adopted.len()
            + self.removed_dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repairs() == 0 && !self.index_corrupt
    }
}

/// Outcome of [`PackageCache::rebuild_index`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub restored: Vec<DependencyHash>,
    pub removed: Vec<DependencyHash>,
}

enum Probe {
    Ready(PathBuf),
    Failed(String),
    Missing,
}

/// Content-addressed store of installed dependency sets.
pub struct PackageCache {
    config: CacheConfig,
    layout: CacheLayout,
    leases: LeaseManager,
    packages: PackageRepository,
    installer: Arc<dyn PackageInstaller>,
    healthy: AtomicBool,
    events: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl PackageCache {
    pub async fn new(
        mut config: CacheConfig,
        db: Database,
        installer: Arc<dyn PackageInstaller>,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.root).await?;
        config.root = fs::canonicalize(&config.root).await?;

        let layout = CacheLayout::new(config.root.clone());
        layout.init().await?;
        let leases = LeaseManager::new(layout.lease_dir(), config.lease_ttl, config.lease_grace);

        tracing::info!(root = %config.root.display(), "Package cache ready");

        Ok(Self {
            config,
            layout,
            leases,
            packages: PackageRepository::new(db),
            installer,
            healthy: AtomicBool::new(true),
            events: None,
        })
    }

    /// Broadcast install/evict events on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Where an entry for `hash` is (or would be) published.
    pub fn path_for(&self, hash: &DependencyHash) -> PathBuf {
        self.layout.entry_dir(hash)
    }

    pub async fn entry(&self, hash: &DependencyHash) -> Result<Option<PackageEntry>, CacheError> {
        self.index(self.packages.get(hash).await)
    }

    pub async fn entries(&self) -> Result<Vec<PackageEntry>, CacheError> {
        self.index(self.packages.list().await)
    }

    /// Resolve `spec` to a ready install directory, installing it if no
    /// one has yet, and record `job_id` as a holder.
    ///
    /// Blocks while another holder installs the same set, up to the
    /// configured lease timeout.
    pub async fn ensure(
        &self,
        spec: &DependencySpec,
        job_id: JobId,
    ) -> Result<PathBuf, CacheError> {
        let hash = spec.hash();
        let started = Utc::now();
        let deadline = Instant::now() + self.config.lease_timeout;
        let mut delay = self.config.poll_interval;

        loop {
            if !self.is_healthy() {
                return Err(CacheError::Unhealthy);
            }

            match self.probe(&hash, job_id, started).await? {
                Probe::Ready(path) => return Ok(path),
                Probe::Failed(message) => return Err(CacheError::Install { hash, message }),
                Probe::Missing => {}
            }

            if let Some(guard) = self.leases.try_acquire(&hash).await? {
                let outcome = self
                    .install_under_lease(&hash, spec, job_id, started, &guard)
                    .await;
                guard.release().await;
                match outcome? {
                    Some(path) => return Ok(path),
                    None => continue,
                }
            }

            if self.leases.reclaim_if_stale(&hash).await? {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(hash = %hash, job_id = %job_id, "Gave up waiting for package lease");
                return Err(CacheError::LeaseTimeout(hash));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Drop `job_id`'s reference on `hash`. Releasing twice is a no-op.
    pub async fn release(&self, hash: &DependencyHash, job_id: JobId) -> Result<bool, CacheError> {
        let released = self
            .index(self.packages.release(hash, job_id).await)?
            .is_some();
        if released {
            tracing::debug!(hash = %hash, job_id = %job_id, "Released package reference");
            self.emit(OrchestratorEvent::PackageReleased {
                dependency_hash: hash.clone(),
                job_id,
                timestamp: Utc::now(),
            });
        }
        Ok(released)
    }

    /// Evict unreferenced entries idle beyond the retention window.
    pub async fn collect_garbage(&self) -> Result<Vec<DependencyHash>, CacheError> {
        if !self.is_healthy() {
            return Err(CacheError::Unhealthy);
        }
        let now = Utc::now();
        let mut evicted = Vec::new();

        for entry in self.entries().await? {
            if !entry.is_eviction_eligible(now, self.config.retention) {
                continue;
            }
            let hash = entry.dependency_hash;
            let Some(guard) = self.leases.try_acquire(&hash).await? else {
                continue;
            };
            let result = self.evict(&hash).await;
            guard.release().await;
            if result? {
                evicted.push(hash);
            }
        }

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "Evicted unreferenced packages");
        }
        Ok(evicted)
    }

    /// Repair drift between the index, the leases and the filesystem.
    pub async fn reconcile(&self) -> Result<CacheRepairReport, CacheError> {
        let mut report = CacheRepairReport::default();

        let (lease_hashes, leftovers) = self.leases.list().await?;
        for hash in lease_hashes {
            if self.leases.reclaim_if_stale(&hash).await? {
                report.reclaimed_leases.push(hash);
            }
        }
        for path in leftovers {
            if self.is_abandoned_file(&path).await {
                remove_path(&path).await?;
                report.removed_leftovers += 1;
            }
        }

        for (path, owner) in self.layout.tmp_dirs().await? {
            let held = match &owner {
                Some(hash) => self.leases.is_held(hash).await?,
                None => false,
            };
            if !held {
                tracing::info!(path = %path.display(), "Removing abandoned staging directory");
                remove_path(&path).await?;
                report.removed_staging += 1;
            }
        }

        let rows = match self.packages.list().await {
            Ok(rows) => rows,
            Err(DbError::Corrupt { key, message, .. }) => {
                self.mark_unhealthy(&key, &message);
                report.index_corrupt = true;
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut indexed: HashSet<DependencyHash> = HashSet::new();
        for entry in rows {
            let hash = entry.dependency_hash.clone();
            let suspicious = match entry.state {
                PackageState::Ready => !self.layout.is_published(&hash).await,
                PackageState::Pending => !self.leases.is_held(&hash).await?,
                PackageState::Failed => false,
            };
            if suspicious && self.drop_row_if_broken(&hash).await? {
                report.dropped_rows.push(hash);
            } else {
                indexed.insert(hash);
            }
        }

        for hash in self.layout.entry_dirs().await? {
            if indexed.contains(&hash) {
                continue;
            }
            let Some(guard) = self.leases.try_acquire(&hash).await? else {
                continue;
            };
            let result = self.settle_unindexed_dir(&hash).await;
            guard.release().await;
            match result? {
                Some(true) => report.adopted.push(hash),
                Some(false) => report.removed_dirs.push(hash),
                None => {}
            }
        }

        if !report.is_empty() {
            tracing::info!(repairs = report.repairs(), "Package cache reconciled");
        }
        Ok(report)
    }

    /// Replace the index with what the filesystem holds.
    ///
    /// `active_refs` maps hashes to the jobs that still need them.
    pub async fn rebuild_index(
        &self,
        active_refs: &HashMap<DependencyHash, Vec<JobId>>,
    ) -> Result<RebuildReport, CacheError> {
        tracing::warn!("Rebuilding package index from the cache directory");
        self.packages.delete_all().await?;

        let mut report = RebuildReport::default();
        for hash in self.layout.entry_dirs().await? {
            match self.layout.read_marker(&hash).await {
                Some(marker) => {
                    let holders = active_refs.get(&hash).cloned().unwrap_or_default();
                    self.adopt(&hash, marker, holders).await?;
                    report.restored.push(hash);
                }
                None if !self.leases.is_held(&hash).await? => {
                    remove_path(&self.layout.entry_dir(&hash)).await?;
                    report.removed.push(hash);
                }
                None => {}
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        tracing::info!(
            restored = report.restored.len(),
            removed = report.removed.len(),
            "Package index rebuilt"
        );
        Ok(report)
    }

    /// Remove every entry, lease and staging directory.
    ///
    /// Only safe while no job is using the cache.
    pub async fn purge_all(&self) -> Result<(), CacheError> {
        self.packages.delete_all().await?;
        self.layout.purge().await?;
        self.healthy.store(true, Ordering::SeqCst);
        tracing::info!("Package cache purged");
        Ok(())
    }

    async fn probe(
        &self,
        hash: &DependencyHash,
        job_id: JobId,
        started: chrono::DateTime<Utc>,
    ) -> Result<Probe, CacheError> {
        let Some(entry) = self.entry(hash).await? else {
            return Ok(Probe::Missing);
        };
        match entry.state {
            PackageState::Ready if self.layout.is_published(hash).await => {
                Ok(match self.index(self.packages.add_holder(hash, job_id).await)? {
                    Some(_) => Probe::Ready(self.layout.entry_dir(hash)),
                    None => Probe::Missing,
                })
            }
            // Only failures newer than our request are ours to report
            PackageState::Failed if entry.updated_at >= started => {
                Ok(Probe::Failed(entry.error.unwrap_or_default()))
            }
            _ => Ok(Probe::Missing),
        }
    }

    async fn install_under_lease(
        &self,
        hash: &DependencyHash,
        spec: &DependencySpec,
        job_id: JobId,
        started: chrono::DateTime<Utc>,
        guard: &LeaseGuard,
    ) -> Result<Option<PathBuf>, CacheError> {
        match self.probe(hash, job_id, started).await? {
            Probe::Ready(path) => return Ok(Some(path)),
            Probe::Failed(message) => {
                return Err(CacheError::Install {
                    hash: hash.clone(),
                    message,
                });
            }
            Probe::Missing => {}
        }

        let final_dir = self.layout.entry_dir(hash);

        if let Some(marker) = self.layout.read_marker(hash).await {
            tracing::info!(hash = %hash, "Adopting published directory without a ready row");
            self.adopt(hash, marker, Vec::new()).await?;
            return self.hold(hash, job_id).await;
        }

        remove_path(&final_dir).await?;
        let pending = PackageEntry::pending(hash.clone(), final_dir.clone(), spec.clone());
        self.index(self.packages.upsert(&pending).await)?;

        let staging = self.layout.new_tmp(hash);
        fs::create_dir_all(&staging).await?;
        tracing::info!(hash = %hash, job_id = %job_id, "Installing dependency set");

        if let Err(message) = self.install_with_renewal(spec, &staging, guard).await {
            if let Err(e) = remove_path(&staging).await {
                tracing::warn!(hash = %hash, error = %e, "Failed to remove staging directory");
            }
            self.index(self.packages.mark_failed(hash, &message).await)?;
            tracing::warn!(hash = %hash, error = %message, "Dependency install failed");
            self.emit(OrchestratorEvent::PackageFailed {
                dependency_hash: hash.clone(),
                error: message.clone(),
                timestamp: Utc::now(),
            });
            return Err(CacheError::Install {
                hash: hash.clone(),
                message,
            });
        }

        let marker = ReadyMarker {
            dependency_hash: hash.clone(),
            dependencies: spec.clone(),
            installed_at: Utc::now(),
        };
        write_marker(&staging, &marker).await?;
        fs::rename(&staging, &final_dir).await?;
        self.index(self.packages.mark_ready(hash).await)?;

        tracing::info!(hash = %hash, "Dependency set published");
        self.emit(OrchestratorEvent::PackageInstalled {
            dependency_hash: hash.clone(),
            timestamp: Utc::now(),
        });

        self.hold(hash, job_id).await
    }

    async fn install_with_renewal(
        &self,
        spec: &DependencySpec,
        staging: &Path,
        guard: &LeaseGuard,
    ) -> Result<(), String> {
        let mut install = self.installer.install(spec, staging);
        let period = (self.leases.ttl() / 3).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval(period);
        renew.tick().await;

        loop {
            tokio::select! {
                result = &mut install => return result.map_err(|e| e.to_string()),
                _ = renew.tick() => {
                    if let Err(e) = self.leases.renew(guard).await {
                        tracing::warn!(hash = %guard.hash(), error = %e, "Failed to renew package lease");
                    }
                }
            }
        }
    }

    async fn hold(&self, hash: &DependencyHash, job_id: JobId) -> Result<Option<PathBuf>, CacheError> {
        Ok(self
            .index(self.packages.add_holder(hash, job_id).await)?
            .map(|_| self.layout.entry_dir(hash)))
    }

    async fn evict(&self, hash: &DependencyHash) -> Result<bool, CacheError> {
        // Holders may have come and gone since the listing
        let Some(current) = self.entry(hash).await? else {
            return Ok(false);
        };
        if !current.is_eviction_eligible(Utc::now(), self.config.retention) {
            return Ok(false);
        }
        if self
            .index(self.packages.delete_if_unreferenced(hash).await)?
            .is_none()
        {
            return Ok(false);
        }
        remove_path(&self.layout.entry_dir(hash)).await?;

        tracing::info!(hash = %hash, "Evicted package");
        self.emit(OrchestratorEvent::PackageEvicted {
            dependency_hash: hash.clone(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Drop a ready row without a published directory, or a pending row
    /// nobody is installing. Rechecked under the lease.
    async fn drop_row_if_broken(&self, hash: &DependencyHash) -> Result<bool, CacheError> {
        let Some(guard) = self.leases.try_acquire(hash).await? else {
            return Ok(false);
        };
        let result = async {
            let Some(entry) = self.entry(hash).await? else {
                return Ok(false);
            };
            let broken = match entry.state {
                PackageState::Ready => !self.layout.is_published(hash).await,
                PackageState::Pending => true,
                PackageState::Failed => false,
            };
            if broken {
                tracing::info!(hash = %hash, state = %entry.state, "Dropping index row without a usable install");
                self.packages.delete(hash).await?;
            }
            Ok::<bool, CacheError>(broken)
        }
        .await;
        guard.release().await;
        result
    }

    /// Adopt a marker-bearing directory with no row, or remove it.
    ///
    /// `Some(true)` adopted, `Some(false)` removed, `None` left alone.
    async fn settle_unindexed_dir(&self, hash: &DependencyHash) -> Result<Option<bool>, CacheError> {
        if self.entry(hash).await?.is_some() {
            return Ok(None);
        }
        match self.layout.read_marker(hash).await {
            Some(marker) => {
                tracing::info!(hash = %hash, "Adopting unindexed package directory");
                self.adopt(hash, marker, Vec::new()).await?;
                Ok(Some(true))
            }
            None => {
                tracing::info!(hash = %hash, "Removing unindexed directory without marker");
                remove_path(&self.layout.entry_dir(hash)).await?;
                Ok(Some(false))
            }
        }
    }

    async fn adopt(
        &self,
        hash: &DependencyHash,
        marker: ReadyMarker,
        holders: Vec<JobId>,
    ) -> Result<PackageEntry, CacheError> {
        let now = Utc::now();
        let entry = PackageEntry {
            dependency_hash: hash.clone(),
            install_path: self.layout.entry_dir(hash),
            dependencies: marker.dependencies,
            state: PackageState::Ready,
            holders,
            error: None,
            created_at: marker.installed_at,
            updated_at: now,
            last_used_at: now,
        };
        self.index(self.packages.upsert(&entry).await)
    }

    async fn is_abandoned_file(&self, path: &Path) -> bool {
        let window = self.config.lease_ttl + self.config.lease_grace;
        fs::metadata(path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > window)
    }

    /// Route index errors, flipping to unhealthy on undecodable rows.
    fn index<T>(&self, result: Result<T, DbError>) -> Result<T, CacheError> {
        match result {
            Err(DbError::Corrupt { key, message, .. }) => {
                self.mark_unhealthy(&key, &message);
                Err(CacheError::Unhealthy)
            }
            other => other.map_err(Into::into),
        }
    }

    fn mark_unhealthy(&self, key: &str, message: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            tracing::error!(key = %key, error = %message, "Package index corrupt; refusing operations until rebuilt");
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

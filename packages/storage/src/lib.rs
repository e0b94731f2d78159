//! Job-scoped artifact storage.
//!
//! Each job gets a directory `<root>/<job_id>/` that is bind-mounted
//! read-write into its sibling container. After the container exits the
//! directory is scanned through `object_store` and every file becomes an
//! [`ArtifactRecord`] with a sha256 checksum.
//!
//! Only the local filesystem backend is supported: the directory has to be
//! visible to the container runtime as a host path.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use orchestrator_core::{ArtifactRecord, JobId};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    /// Artifact root as seen by this process.
    pub root: PathBuf,
}

impl ArtifactStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build a config from environment variables.
    ///
    /// - `ARTIFACT_ROOT` (default: `./data/artifacts`)
    pub fn from_env() -> Result<Self, StorageError> {
        let root = std::env::var("ARTIFACT_ROOT")
            .ok()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/artifacts"));
        if root.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig(
                "ARTIFACT_ROOT must not be empty".into(),
            ));
        }
        Ok(Self { root })
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    pub async fn new(cfg: ArtifactStoreConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&cfg.root).await?;
        let root = tokio::fs::canonicalize(&cfg.root).await?;
        let store = LocalFileSystem::new_with_prefix(&root)?;
        Ok(Self {
            root,
            store: Arc::new(store),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Local path of a job's artifact directory.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create an empty artifact directory for the job's current attempt.
    ///
    /// Leftovers from an earlier attempt are removed first.
    pub async fn prepare(&self, job_id: JobId) -> Result<PathBuf, StorageError> {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "Cleared stale artifact directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Write an artifact produced outside the container, such as its log.
    pub async fn put(&self, job_id: JobId, name: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(job_id, name)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: JobId, name: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(job_id, name)?;
        let res = self.store.get(&path).await?;
        Ok(res.bytes().await?)
    }

    /// Scan the job's directory and describe every file in it.
    pub async fn collect(&self, job_id: JobId) -> Result<Vec<ArtifactRecord>, StorageError> {
        let prefix = Path::from(job_id.to_string());
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut records = Vec::with_capacity(objects.len());
        for meta in objects {
            let Some(relative) = meta
                .location
                .as_ref()
                .strip_prefix(prefix.as_ref())
                .map(|rest| rest.trim_start_matches('/').to_string())
            else {
                continue;
            };
            let bytes = self.store.get(&meta.location).await?.bytes().await?;
            records.push(ArtifactRecord {
                job_id,
                path: relative,
                checksum: hex::encode(Sha256::digest(&bytes)),
                size: bytes.len() as u64,
            });
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::debug!(job_id = %job_id, count = records.len(), "Collected artifacts");
        Ok(records)
    }

    /// Remove the job's directory and everything in it.
    pub async fn remove(&self, job_id: JobId) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_path(&self, job_id: JobId, name: &str) -> Result<Path, StorageError> {
        let name = name.trim_start_matches('/');
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return Err(StorageError::InvalidConfig(format!(
                "invalid artifact name: {name:?}"
            )));
        }
        Ok(Path::from(format!("{job_id}/{name}")))
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

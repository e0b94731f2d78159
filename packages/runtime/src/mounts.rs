//! Bind mounts for sibling containers.
//!
//! The worker sees the cache and artifact volumes at its own mount points,
//! but the host daemon resolves bind sources on the host. Every source is
//! checked against its root in the worker's view, then rewritten onto the
//! matching host root.

use std::path::{Path, PathBuf};

use orchestrator_core::Mount;

/// Where the package directory appears inside the container.
pub const PACKAGE_MOUNT: &str = "/opt/packages";
/// Where the artifact directory appears inside the container.
pub const ARTIFACT_MOUNT: &str = "/artifacts";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("cannot resolve mount source {path}: {source}")]
    Resolve {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("mount source {path} is not strictly inside {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// Maps a directory tree as seen by the worker onto the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    local_root: PathBuf,
    host_root: PathBuf,
}

impl PathMapping {
    pub fn new(local_root: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            host_root: host_root.into(),
        }
    }

    /// Worker and host share the same paths (worker not containerized).
    pub fn identity(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::new(root.clone(), root)
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Validate `path` and translate it to its host location.
    pub fn to_host(&self, path: &Path) -> Result<PathBuf, MountError> {
        let resolve = |p: &Path| {
            std::fs::canonicalize(p).map_err(|source| MountError::Resolve {
                path: p.to_path_buf(),
                source,
            })
        };
        let root = resolve(&self.local_root)?;
        let canonical = resolve(path)?;

        let relative = match canonical.strip_prefix(&root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => {
                return Err(MountError::OutsideRoot {
                    path: canonical,
                    root,
                });
            }
        };
        Ok(self.host_root.join(relative))
    }
}

/// Builds the two job-scoped mounts every sibling container gets.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub packages: PathMapping,
    pub artifacts: PathMapping,
}

impl MountPlan {
    pub fn new(packages: PathMapping, artifacts: PathMapping) -> Self {
        Self {
            packages,
            artifacts,
        }
    }

    /// Package directory read-only, artifact directory read-write.
    pub fn mounts(&self, package_dir: &Path, artifact_dir: &Path) -> Result<Vec<Mount>, MountError> {
        Ok(vec![
            Mount::read_only(self.packages.to_host(package_dir)?, PACKAGE_MOUNT),
            Mount::read_write(self.artifacts.to_host(artifact_dir)?, ARTIFACT_MOUNT),
        ])
    }
}

//! Shared package cache.
//!
//! Installed dependency sets live under a content-addressed directory
//! named by the hash of their normalized specification. Each set is
//! installed once across every worker sharing the cache volume: a
//! hash-scoped lease file elects one installer while others wait for the
//! published result. The `package` table indexes entries and tracks which
//! jobs currently hold a reference.

mod config;
mod installer;
mod layout;
mod lease;
mod package_cache;

use orchestrator_core::DependencyHash;

pub use config::CacheConfig;
pub use installer::{CommandInstaller, InstallError, InstallFuture, PackageInstaller};
pub use layout::ReadyMarker;
pub use lease::{LeaseGuard, LeaseManager, LeaseRecord, LeaseState};
pub use package_cache::{CacheRepairReport, PackageCache, RebuildReport};

/// Cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] db::DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for the lease on {0}")]
    LeaseTimeout(DependencyHash),

    #[error("lease on {0} was taken over")]
    LeaseLost(DependencyHash),

    #[error("installing {hash} failed: {message}")]
    Install {
        hash: DependencyHash,
        message: String,
    },

    #[error("package index is unhealthy; a rebuild is required")]
    Unhealthy,
}

impl CacheError {
    /// Whether the failure says something about the dependency set itself
    /// rather than the infrastructure around it.
    pub fn is_install_failure(&self) -> bool {
        matches!(self, CacheError::Install { .. })
    }
}

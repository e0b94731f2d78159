//! Daemon configuration assembled from the environment.

use std::path::PathBuf;

use actors::OrchestratorConfig;
use cache::CacheConfig;
use db::DbConfig;
use runtime::LifecycleConfig;
use storage::ArtifactStoreConfig;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Db(#[from] db::DbError),

    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Runtime(#[from] runtime::RuntimeError),

    #[error(transparent)]
    Lifecycle(#[from] runtime::LifecycleError),

    #[error(transparent)]
    Actor(#[from] actors::ActorError),

    #[error("failed to start supervisor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where this process and the container runtime see the shared roots.
///
/// The daemon usually runs in a container itself, so the path it writes to
/// and the path the Docker host must bind-mount differ.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostRoots {
    pub cache: Option<PathBuf>,
    pub artifacts: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db: DbConfig,
    pub cache: CacheConfig,
    pub artifacts: ArtifactStoreConfig,
    pub lifecycle: LifecycleConfig,
    pub orchestrator: OrchestratorConfig,
    pub host_roots: HostRoots,
}

impl DaemonConfig {
    /// Build the full configuration from environment variables.
    ///
    /// Beyond each component's own variables:
    /// - `DB_ENDPOINT` (default: `mem://`), `DB_USER` and `DB_PASSWORD`
    /// - `CACHE_HOST_ROOT`, `ARTIFACT_HOST_ROOT` (default: same as local)
    pub fn from_env() -> Result<Self, DaemonError> {
        let lookup = |key: &str| std::env::var(key).ok();
        Ok(Self {
            db: db_config(lookup)?,
            cache: CacheConfig::from_env()?,
            artifacts: ArtifactStoreConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            host_roots: host_roots(lookup),
        })
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn db_config(lookup: impl Fn(&str) -> Option<String>) -> Result<DbConfig, DaemonError> {
    let mut config = match non_empty(lookup("DB_ENDPOINT")) {
        Some(endpoint) => DbConfig::endpoint(endpoint),
        None => DbConfig::memory(),
    };
    match (non_empty(lookup("DB_USER")), non_empty(lookup("DB_PASSWORD"))) {
        (Some(user), Some(password)) => config = config.with_credentials(user, password),
        (None, None) => {}
        _ => {
            return Err(DaemonError::Config(
                "DB_USER and DB_PASSWORD must be set together".into(),
            ));
        }
    }
    Ok(config)
}

fn host_roots(lookup: impl Fn(&str) -> Option<String>) -> HostRoots {
    HostRoots {
        cache: non_empty(lookup("CACHE_HOST_ROOT")).map(PathBuf::from),
        artifacts: non_empty(lookup("ARTIFACT_HOST_ROOT")).map(PathBuf::from),
    }
}

//! Container runtime capability.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use orchestrator_core::{JOB_ID_LABEL, JobId, Mount, ResourceLimits};

/// Errors reported by a container runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

/// Future type for async runtime calls.
pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RuntimeError>> + Send + 'a>>;

/// Everything needed to create one sibling container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// False once the container has exited but before it is removed.
    pub running: bool,
}

impl RuntimeContainer {
    /// The owning job, if the container carries a parseable job label.
    pub fn job_id(&self) -> Option<JobId> {
        self.labels
            .get(JOB_ID_LABEL)
            .and_then(|raw| JobId::parse(raw).ok())
    }
}

/// Injectable access to the host's container runtime.
///
/// `id` arguments accept either the runtime id or the container name.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Create and start a container.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, RuntimeContainer>;

    /// Block until the container exits and return its exit code.
    fn wait<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, i64>;

    /// Stop the container. Stopping an exited container is not an error.
    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    /// Force-remove the container.
    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    /// Every container managed by this system, exited ones included.
    fn list_managed(&self) -> RuntimeFuture<'_, Vec<RuntimeContainer>>;

    /// Running containers managed by this system.
    fn list_running(&self) -> RuntimeFuture<'_, Vec<RuntimeContainer>> {
        Box::pin(async move {
            let mut containers = self.list_managed().await?;
            containers.retain(|c| c.running);
            Ok(containers)
        })
    }

    /// Combined stdout/stderr of the container.
    fn logs<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, String>;
}

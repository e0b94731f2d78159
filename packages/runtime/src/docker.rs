//! Docker Engine backend.
//!
//! The worker talks to the host daemon through its socket, so every
//! container created here is a sibling of the worker rather than a child.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use bollard::errors::Error as DockerError;
use futures_util::StreamExt;
use orchestrator_core::{MANAGED_LABEL, ResourceLimits};
use tokio::sync::RwLock;

use crate::client::{ContainerRuntime, ContainerSpec, RuntimeContainer, RuntimeError, RuntimeFuture};

/// Seconds a container gets to exit after SIGTERM before it is killed.
const STOP_TIMEOUT_SECS: i64 = 10;

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone, Default)]
pub struct DockerRuntime {
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    /// Create a runtime that connects lazily on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect now and check the daemon answers.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let runtime = Self::new();
        let docker = runtime.docker().await?;
        docker.ping().await.map_err(map_error)?;
        Ok(runtime)
    }

    async fn docker(&self) -> Result<Docker, RuntimeError> {
        if let Some(docker) = self.docker.read().await.as_ref() {
            return Ok(docker.clone());
        }
        let mut slot = self.docker.write().await;
        if let Some(docker) = slot.as_ref() {
            return Ok(docker.clone());
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        *slot = Some(docker.clone());
        Ok(docker)
    }
}

fn map_error(e: DockerError) -> RuntimeError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::IOError { .. } | DockerError::RequestTimeoutError => {
            RuntimeError::Unavailable(e.to_string())
        }
        other => RuntimeError::Other(other.to_string()),
    }
}

fn binds(spec: &ContainerSpec) -> Vec<String> {
    spec.mounts
        .iter()
        .map(|m| {
            format!(
                "{}:{}:{}",
                m.source.display(),
                m.target.display(),
                if m.read_only { "ro" } else { "rw" }
            )
        })
        .collect()
}

/// Memory in bytes and CPU in nano-cores, as the Engine API expects them.
fn host_limits(limits: &ResourceLimits) -> Result<(i64, i64), RuntimeError> {
    let memory = limits
        .memory_mb
        .checked_mul(1024 * 1024)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| RuntimeError::Other(format!("memory limit {} MiB is too large", limits.memory_mb)))?;
    let nano_cpus = limits.cpu * 1_000_000_000.0;
    if !nano_cpus.is_finite() || nano_cpus < 1.0 || nano_cpus >= i64::MAX as f64 {
        return Err(RuntimeError::Other(format!("cpu limit {} is out of range", limits.cpu)));
    }
    Ok((memory, nano_cpus as i64))
}

impl ContainerRuntime for DockerRuntime {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, RuntimeContainer> {
        Box::pin(async move {
            use bollard::container::{Config, CreateContainerOptions};
            use bollard::models::HostConfig;

            let (memory, nano_cpus) = host_limits(&spec.limits)?;
            let docker = self.docker().await?;
            let binds = binds(spec);
            let host_config = HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                ..Default::default()
            };
            let config = Config {
                image: Some(spec.image.clone()),
                env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
                labels: Some(spec.labels.clone()),
                host_config: Some(host_config),
                ..Default::default()
            };
            let options = CreateContainerOptions {
                name: spec.name.clone(),
                ..Default::default()
            };

            let response = docker
                .create_container(Some(options), config)
                .await
                .map_err(map_error)?;
            let id = response.id;

            if let Err(e) = docker.start_container::<String>(&id, None).await {
                // Leave nothing half-created behind
                let _ = self.remove(&id).await;
                return Err(map_error(e));
            }

            tracing::info!(container = %spec.name, id = %id, "Started sibling container");
            Ok(RuntimeContainer {
                id,
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                running: true,
            })
        })
    }

    fn wait<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, i64> {
        Box::pin(async move {
            use bollard::container::WaitContainerOptions;

            let docker = self.docker().await?;
            let mut stream = docker.wait_container(
                id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // Non-zero exits arrive as an error carrying the code
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(map_error(e)),
                None => Err(RuntimeError::Other(format!("wait on {} ended early", id))),
            }
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let docker = self.docker().await?;
            match docker
                .stop_container(
                    id,
                    Some(bollard::container::StopContainerOptions {
                        t: STOP_TIMEOUT_SECS,
                    }),
                )
                .await
            {
                Ok(()) => Ok(()),
                // Already stopped
                Err(DockerError::DockerResponseServerError {
                    status_code: 304, ..
                }) => Ok(()),
                Err(e) => Err(map_error(e)),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let docker = self.docker().await?;
            docker
                .remove_container(
                    id,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(map_error)
        })
    }

    fn list_managed(&self) -> RuntimeFuture<'_, Vec<RuntimeContainer>> {
        Box::pin(async move {
            use bollard::container::ListContainersOptions;

            let docker = self.docker().await?;
            let filters = HashMap::from([(
                "label".to_string(),
                vec![format!("{}=true", MANAGED_LABEL)],
            )]);
            let summaries = docker
                .list_containers(Some(ListContainersOptions::<String> {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(map_error)?;

            Ok(summaries
                .into_iter()
                .filter_map(|summary| {
                    let id = summary.id?;
                    let name = summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default();
                    Some(RuntimeContainer {
                        id,
                        name,
                        labels: summary.labels.unwrap_or_default(),
                        running: summary.state.as_deref() == Some("running"),
                    })
                })
                .collect())
        })
    }

    fn logs<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, String> {
        Box::pin(async move {
            use bollard::container::LogsOptions;

            let docker = self.docker().await?;
            let mut stream = docker.logs(
                id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: "all".to_string(),
                    ..Default::default()
                }),
            );
            let mut out = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_error)?;
                out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::Mount;

    #[test]
    fn binds_carry_access_mode() {
        let spec = ContainerSpec {
            name: "sibling-x".into(),
            image: "agent:latest".into(),
            env: Vec::new(),
            labels: HashMap::new(),
            mounts: vec![
                Mount::read_only("/srv/cache/abc", "/opt/packages"),
                Mount::read_write("/srv/artifacts/job", "/artifacts"),
            ],
            limits: ResourceLimits::new(1.0, 256, 60),
        };
        assert_eq!(
            binds(&spec),
            [
                "/srv/cache/abc:/opt/packages:ro",
                "/srv/artifacts/job:/artifacts:rw"
            ]
        );
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let err = map_error(DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        });
        assert!(err.is_not_found());
        let err = map_error(DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        });
        assert!(!err.is_not_found() && !err.is_transient());
    }

    #[test]
    fn limits_convert_to_engine_units() -> Result<(), RuntimeError> {
        assert_eq!(
            host_limits(&ResourceLimits::new(0.5, 256, 60))?,
            (256 * 1024 * 1024, 500_000_000)
        );
        assert!(host_limits(&ResourceLimits::new(1.0, u64::MAX, 60)).is_err());
        assert!(host_limits(&ResourceLimits::new(1.0, 1 << 43, 60)).is_err());
        assert!(host_limits(&ResourceLimits::new(f64::MAX, 256, 60)).is_err());
        Ok(())
    }
}

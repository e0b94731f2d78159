//! In-memory runtime for tests and local runs without a Docker daemon.
//!
//! A container's behaviour is scripted by its payload reference, read as
//! `;`-separated directives:
//!
//! - `exit=<code>`: exit with `code` (default 0)
//! - `sleep=<ms>`: run for `ms` before exiting
//! - `hang`: run until stopped
//! - `write=<file>`: write `<file>` into the `/artifacts` mount
//! - `create-delay=<ms>`: take `ms` to create
//! - `fail-create`: reject the create call
//! - `unavailable`: behave as if the daemon were down

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use orchestrator_core::PAYLOAD_LABEL;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::client::{ContainerRuntime, ContainerSpec, RuntimeContainer, RuntimeError, RuntimeFuture};
use crate::mounts::ARTIFACT_MOUNT;

/// Exit code reported for containers stopped before they finished.
pub const STOPPED_EXIT_CODE: i64 = 137;

#[derive(Debug, Default, Clone, PartialEq)]
struct Script {
    exit_code: i64,
    run_for: Duration,
    hang: bool,
    writes: Vec<String>,
    create_delay: Duration,
    fail_create: bool,
    unavailable: bool,
}

impl Script {
    fn parse(payload: &str) -> Self {
        let mut script = Script::default();
        for directive in payload.split(';').map(str::trim) {
            let (key, value) = directive.split_once('=').unwrap_or((directive, ""));
            let millis = || Duration::from_millis(value.parse().unwrap_or(0));
            match key {
                "exit" => script.exit_code = value.parse().unwrap_or(1),
                "sleep" => script.run_for = millis(),
                "hang" => script.hang = true,
                "write" if !value.is_empty() => script.writes.push(value.to_string()),
                "create-delay" => script.create_delay = millis(),
                "fail-create" => script.fail_create = true,
                "unavailable" => script.unavailable = true,
                _ => {}
            }
        }
        script
    }
}

struct FakeContainer {
    container: RuntimeContainer,
    exit: watch::Sender<Option<i64>>,
    logs: String,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerSpec>,
}

impl FakeState {
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.container.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

/// Scripted [`ContainerRuntime`] that keeps containers in memory.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of create calls that reached the runtime.
    pub fn create_calls(&self) -> usize {
        self.state.lock().created.len()
    }

    /// Specs of every create call, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().created.clone()
    }

    /// Ids of containers that still exist, running or exited.
    pub fn container_ids(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    /// Drop a container without an exit, as if it vanished from the host.
    pub fn forget(&self, id_or_name: &str) -> bool {
        let mut state = self.state.lock();
        match state.resolve(id_or_name) {
            Some(id) => state.containers.remove(&id).is_some(),
            None => false,
        }
    }

    /// Make every call fail with [`RuntimeError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RuntimeError::Unavailable("fake runtime is down".into()))
        } else {
            Ok(())
        }
    }

    fn exit(&self, id: &str, code: i64) {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(id) {
            let changed = container.exit.send_if_modified(|exit| {
                if exit.is_none() {
                    *exit = Some(code);
                    true
                } else {
                    false
                }
            });
            if changed {
                container.logs.push_str(&format!("exited with {}\n", code));
            }
        }
    }
}

fn write_artifacts(spec: &ContainerSpec, files: &[String]) -> Result<(), RuntimeError> {
    let Some(mount) = spec
        .mounts
        .iter()
        .find(|m| m.target == Path::new(ARTIFACT_MOUNT))
    else {
        return Ok(());
    };
    for file in files {
        std::fs::write(mount.source.join(file), format!("{} from {}\n", file, spec.name))
            .map_err(|e| RuntimeError::Other(e.to_string()))?;
    }
    Ok(())
}

impl ContainerRuntime for FakeRuntime {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, RuntimeContainer> {
        Box::pin(async move {
            self.check_available()?;
            let script = Script::parse(spec.labels.get(PAYLOAD_LABEL).map_or("", String::as_str));
            self.state.lock().created.push(spec.clone());

            if script.unavailable {
                return Err(RuntimeError::Unavailable("daemon not reachable".into()));
            }
            if script.fail_create {
                return Err(RuntimeError::Other(format!("image {} not found", spec.image)));
            }
            tokio::time::sleep(script.create_delay).await;

            let container = {
                let mut state = self.state.lock();
                if state.resolve(&spec.name).is_some() {
                    return Err(RuntimeError::Other(format!(
                        "container name {} already in use",
                        spec.name
                    )));
                }
                let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                let container = RuntimeContainer {
                    id: id.clone(),
                    name: spec.name.clone(),
                    labels: spec.labels.clone(),
                    running: true,
                };
                let (exit, _) = watch::channel(None);
                state.containers.insert(
                    id,
                    FakeContainer {
                        container: container.clone(),
                        exit,
                        logs: format!("starting {}\n", spec.name),
                    },
                );
                container
            };

            write_artifacts(spec, &script.writes)?;

            if !script.hang {
                let runtime = self.clone();
                let id = container.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(script.run_for).await;
                    runtime.exit(&id, script.exit_code);
                });
            }
            Ok(container)
        })
    }

    fn wait<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, i64> {
        Box::pin(async move {
            self.check_available()?;
            let mut rx = {
                let state = self.state.lock();
                let container = state
                    .resolve(id)
                    .and_then(|id| state.containers.get(&id))
                    .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
                container.exit.subscribe()
            };
            let code = *rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| RuntimeError::NotFound(id.to_string()))?;
            Ok(code.unwrap_or(STOPPED_EXIT_CODE))
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let resolved = self
                .state
                .lock()
                .resolve(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            self.exit(&resolved, STOPPED_EXIT_CODE);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock();
            let resolved = state
                .resolve(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            state.containers.remove(&resolved);
            Ok(())
        })
    }

    fn list_managed(&self) -> RuntimeFuture<'_, Vec<RuntimeContainer>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock();
            Ok(state
                .containers
                .values()
                .map(|c| RuntimeContainer {
                    running: c.exit.borrow().is_none(),
                    ..c.container.clone()
                })
                .collect())
        })
    }

    fn logs<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, String> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock();
            state
                .resolve(id)
                .and_then(|id| state.containers.get(&id))
                .map(|c| c.logs.clone())
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
        })
    }
}

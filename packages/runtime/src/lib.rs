//! Sibling container runtime and lifecycle.
//!
//! - [`ContainerRuntime`] abstracts the host's container daemon; [`DockerRuntime`]
//!   talks to Docker, [`FakeRuntime`] keeps scripted containers in memory.
//! - [`MountPlan`] validates job-scoped bind sources and maps them to host paths.
//! - [`LifecycleManager`] drives one job's container from provision to teardown.

mod client;
mod docker;
mod fake;
mod lifecycle;
mod mounts;

pub use client::{ContainerRuntime, ContainerSpec, RuntimeContainer, RuntimeError, RuntimeFuture};
pub use docker::DockerRuntime;
pub use fake::{FakeRuntime, STOPPED_EXIT_CODE};
pub use lifecycle::{CancelOutcome, Completion, LifecycleConfig, LifecycleError, LifecycleManager};
pub use mounts::{ARTIFACT_MOUNT, MountError, MountPlan, PACKAGE_MOUNT, PathMapping};

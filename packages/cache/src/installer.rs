//! Dependency installers.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use orchestrator_core::DependencySpec;

/// Error reported by an installer.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to start installer: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("installer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("{0}")]
    Other(String),
}

/// Future type for async installs.
pub type InstallFuture<'a> = Pin<Box<dyn Future<Output = Result<(), InstallError>> + Send + 'a>>;

/// Installs a dependency set into an empty target directory.
///
/// Implementations only write below `target`; publishing the directory is
/// the cache's job.
pub trait PackageInstaller: Send + Sync + 'static {
    fn install<'a>(&'a self, spec: &'a DependencySpec, target: &'a Path) -> InstallFuture<'a>;
}

/// Runs an external command such as `pip install --target {target}`.
///
/// `{target}` in the template is replaced by the staging directory and the
/// normalized dependency lines are appended as trailing arguments.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    template: Vec<String>,
}

impl Default for CommandInstaller {
    fn default() -> Self {
        Self::new(["pip", "install", "--no-input", "--target", "{target}"])
    }
}

impl CommandInstaller {
    pub fn new<I, S>(template: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            template: template.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a whitespace-separated template, as found in `INSTALL_COMMAND`.
    pub fn from_template(template: &str) -> Option<Self> {
        let parts: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        (!parts.is_empty()).then_some(Self { template: parts })
    }

    /// Build a config from environment variables.
    ///
    /// - `INSTALL_COMMAND` (default: `pip install --no-input --target {target}`)
    pub fn from_env() -> Self {
        std::env::var("INSTALL_COMMAND")
            .ok()
            .and_then(|raw| Self::from_template(&raw))
            .unwrap_or_default()
    }

    fn argv(&self, spec: &DependencySpec, target: &Path) -> Vec<String> {
        let target = target.to_string_lossy();
        self.template
            .iter()
            .map(|part| part.replace("{target}", &target))
            .chain(spec.lines().iter().cloned())
            .collect()
    }
}

impl PackageInstaller for CommandInstaller {
    fn install<'a>(&'a self, spec: &'a DependencySpec, target: &'a Path) -> InstallFuture<'a> {
        Box::pin(async move {
            if spec.is_empty() {
                return Ok(());
            }
            let argv = self.argv(spec, target);
            let Some((program, args)) = argv.split_first() else {
                return Err(InstallError::Other("empty install command".into()));
            };

            tracing::info!(command = %argv.join(" "), "Installing dependencies");
            let output = tokio::process::Command::new(program)
                .args(args)
                .current_dir(target)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stdout.lines() {
                tracing::debug!(target: "installer", "{}", line);
            }
            for line in stderr.lines() {
                tracing::debug!(target: "installer", stream = "stderr", "{}", line);
            }

            if output.status.success() {
                Ok(())
            } else {
                Err(InstallError::Failed {
                    status: output.status.to_string(),
                    stderr: stderr.trim().chars().take(2000).collect(),
                })
            }
        })
    }
}

//! Container runtime seam used by the external executor.
//!
//! [`ContainerRuntime`] is the narrow set of operations the executor needs.
//! [`DockerCli`] drives any Docker-compatible CLI (`docker`, `podman`)
//! through `std::process::Command`.

use crate::config::ExternalSettings;
use crate::error::{FlowError, Result};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

/// Everything needed to start one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    /// `(host path, container path)` bind mounts.
    pub mounts: Vec<(PathBuf, String)>,
    /// Arguments appended after the image.
    pub args: Vec<String>,
}

/// Operations the external executor performs on a container runtime.
#[cfg_attr(test, mockall::automock)]
pub trait ContainerRuntime: Send + Sync {
    fn pull(&self, image: &str) -> Result<()>;

    /// Start a detached container and return its id.
    fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Block until the container exits and return its exit code.
    fn wait(&self, id: &str) -> Result<i32>;

    fn stop(&self, id: &str) -> Result<()>;

    fn remove(&self, id: &str) -> Result<()>;

    fn logs(&self, id: &str) -> Result<String>;
}

/// Runtime selected by the settings' `runtime` binary.
pub fn default_runtime(settings: &ExternalSettings) -> Arc<dyn ContainerRuntime> {
    Arc::new(DockerCli::new(settings.runtime.clone()))
}

/// Docker-compatible command line runtime.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, op: &str, args: &[&str]) -> Result<Output> {
        let binary = self.binary.trim();
        if binary.is_empty() {
            return Err(FlowError::Runtime("container runtime binary is empty".into()));
        }
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FlowError::Runtime(format!("{} {}: {}", binary, op, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Runtime(format!(
                "{} {} exited with {}: {}",
                binary,
                op,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Arguments for `run` built from a spec.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];
        for (host, container) in &spec.mounts {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", host.display(), container));
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

impl ContainerRuntime for DockerCli {
    fn pull(&self, image: &str) -> Result<()> {
        tracing::debug!("Pulling image {}", image);
        self.run("pull", &["pull", image]).map(|_| ())
    }

    fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let args = Self::run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run("run", &args)?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(FlowError::Runtime("runtime did not report a container id".into()));
        }
        Ok(id)
    }

    fn wait(&self, id: &str) -> Result<i32> {
        let output = self.run("wait", &["wait", id])?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse()
            .map_err(|_| FlowError::Runtime(format!("unexpected wait output '{}'", text.trim())))
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.run("stop", &["stop", id]).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.run("rm", &["rm", "--force", id]).map(|_| ())
    }

    fn logs(&self, id: &str) -> Result<String> {
        let output = self.run("logs", &["logs", id])?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

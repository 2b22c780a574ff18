//! Pipeline settings
//!
//! These settings are read once when an executor is built and whenever the
//! coordinator is reconfigured. Nothing in the dispatch path reads them from
//! ambient state.
//!
//! # Main Types
//!
//! - [`PipelineSettings`] - Top-level settings file
//! - [`ExecutionMode`] - In-process vs. isolated-external execution
//! - [`ExternalSettings`] - Container image and lifecycle flags
//! - [`LoggingSettings`] - Log filter and optional log directory

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default tracing filter.
pub const DEFAULT_LOG_FILTER: &str = "info,tomoflow=debug";

/// Default container image for the external executor.
pub const DEFAULT_IMAGE: &str = "tomoflow/runner:latest";

/// Where operator chains run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Worker thread inside this process.
    #[default]
    InProcess,
    /// Isolated container driven through a runtime CLI.
    External,
}

impl ExecutionMode {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionMode::InProcess => "in-process",
            ExecutionMode::External => "external",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Parameters of the isolated-external strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSettings {
    /// Image identifier passed to the runtime.
    pub image: String,

    /// Pull the image before each run.
    pub pull: bool,

    /// Remove the container once it exits or is stopped.
    pub remove: bool,

    /// Runtime CLI binary (`docker`, `podman`, ...).
    pub runtime: String,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            pull: true,
            remove: true,
            runtime: "docker".to_string(),
        }
    }
}

/// Logging configuration for the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,

    /// Directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
        }
    }
}

/// Contents of `settings.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub execution_mode: ExecutionMode,
    pub external: ExternalSettings,
    pub logging: LoggingSettings,
}

impl PipelineSettings {
    /// Settings with a different execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }
}

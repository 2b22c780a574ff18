//! Configuration module for tomoflow
//!
//! This module handles:
//! - Pipeline settings (execution mode, container parameters, logging)
//! - Declarative pipeline files consumed by the CLI
//!
//! # Config Location
//!
//! Settings are stored in the platform-appropriate config location:
//! - **Linux**: `~/.config/dev.tomoflow/`
//! - **macOS**: `~/Library/Application Support/dev.tomoflow/`
//! - **Windows**: `%APPDATA%\dev.tomoflow\`
//!
//! # Files
//!
//! - `settings.toml` - [`PipelineSettings`]
//! - Pipeline files (`.toml`) - Saved wherever the user chooses
//!
//! # Example
//!
//! ```ignore
//! use tomoflow::config::{ExecutionMode, PipelineSettings};
//!
//! let settings = PipelineSettings::load_or_default();
//! let settings = settings.with_mode(ExecutionMode::External);
//! settings.save()?;
//! ```

pub mod project;
pub mod settings;

pub use project::*;
pub use settings::*;

use crate::error::{FlowError, Result};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.tomoflow";

/// Settings filename
pub const SETTINGS_FILE: &str = "settings.toml";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()
        .ok_or_else(|| FlowError::Config("Could not determine config directory".to_string()))?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            FlowError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the settings file
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(SETTINGS_FILE))
}

impl PipelineSettings {
    /// Load settings from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = settings_path()
            .ok_or_else(|| FlowError::Config("Could not determine settings path".to_string()))?;
        Self::load_from(path)
    }

    /// Load settings from an explicit path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("Failed to read settings: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Load settings, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_config_dir()?;
        self.save_to(dir.join(SETTINGS_FILE))
    }

    /// Save settings to an explicit path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| FlowError::Config(format!("Failed to write settings: {}", e)))
    }
}

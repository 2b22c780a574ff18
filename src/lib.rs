//! # tomoflow: operator pipelines over image volumes
//!
//! A tree of data sources, each carrying a volume and an ordered chain of
//! transform operators. Edits to the tree are turned into the smallest
//! re-execution that brings every output up to date.
//!
//! ## Architecture
//!
//! - **Pipeline**: the coordinator. Owns the tree, tracks staleness and edit
//!   sessions, and decides what runs next
//! - **Executor**: runs a chain either on a worker thread or inside a
//!   container, reporting back over crossbeam channels
//! - **Transforms**: built-in operators, Rhai per-voxel scripts and plugins
//! - **Config**: TOML settings and pipeline files
//!
//! ## Configuration
//!
//! Settings are stored in the platform configuration directory under
//! `dev.tomoflow`:
//!
//! - **Linux**: `~/.config/dev.tomoflow/settings.toml`
//! - **macOS**: `~/Library/Application Support/dev.tomoflow/settings.toml`
//! - **Windows**: `%APPDATA%\dev.tomoflow\settings.toml`
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tomoflow::{
//!     config::PipelineSettings,
//!     pipeline::Pipeline,
//!     transforms::{AddConstant, BuiltinTransform},
//!     volume::{Volume, VolumeProperties},
//! };
//!
//! let settings = PipelineSettings::load_or_default();
//! let mut pipeline = Pipeline::new(Volume::zeros([64, 64, 64]), VolumeProperties::default(), settings);
//! let root = pipeline.root();
//! pipeline.add_operator(root, BuiltinTransform::AddConstant(AddConstant::new(1.0)))?;
//! pipeline.wait_until_idle(Duration::from_secs(30));
//! let output = pipeline.transformed_data_source(None);
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod scripting;
pub mod transforms;
pub mod volume;

// Re-export commonly used types
pub use config::{ExecutionMode, PipelineFile, PipelineSettings};
pub use error::{FlowError, Result};
pub use executor::PipelineExecutor;
pub use pipeline::{DataSourceId, OperatorId, Pipeline, PipelineError};
pub use transforms::{AnyTransform, BuiltinTransform};
pub use volume::{Volume, VolumeProperties};

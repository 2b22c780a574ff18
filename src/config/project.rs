//! Declarative pipeline files
//!
//! A pipeline file describes the root volume, its physical properties, and
//! the chain of built-in operators applied to it. Operators can carry a
//! nested `branch`: those operators form the chain of the data source that
//! receives the parent chain's output.
//!
//! ```toml
//! name = "denoise"
//!
//! [volume.generate]
//! shape = [32, 32, 32]
//! pattern = "sphere"
//!
//! [properties]
//! spacing = [0.5, 0.5, 1.0]
//! units = "nm"
//!
//! [[operators]]
//! type = "add_constant"
//! constant = 1.5
//!
//! [[operators]]
//! type = "threshold"
//! lower = 1.0
//! upper = 2.0
//!
//! [[operators.branch]]
//! type = "fft_abs_log"
//! ```

use crate::error::{FlowError, Result, ResultExt};
use crate::transforms::BuiltinTransform;
use crate::volume::{Volume, VolumeProperties};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pipeline file extension
pub const PIPELINE_FILE_EXTENSION: &str = "toml";

/// Synthetic fill patterns for generated volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// Every voxel holds `value`.
    #[default]
    Constant,
    /// Normalized x + y + z ramp from 0 to 1.
    Gradient,
    /// 1 inside a centered sphere of a quarter of the smallest extent, else 0.
    Sphere,
}

/// A volume synthesized from a shape and pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedVolume {
    pub shape: [usize; 3],
    #[serde(default)]
    pub pattern: Pattern,
    #[serde(default)]
    pub value: f32,
}

impl GeneratedVolume {
    pub fn generate(&self) -> Volume {
        let shape = self.shape;
        match self.pattern {
            Pattern::Constant => Volume::filled(shape, self.value),
            Pattern::Gradient => {
                let span = (shape.iter().sum::<usize>().saturating_sub(3)).max(1) as f32;
                Volume::from_fn(shape, |x, y, z| (x + y + z) as f32 / span)
            }
            Pattern::Sphere => {
                let center = shape.map(|n| (n as f64 - 1.0) / 2.0);
                let radius = shape.iter().copied().min().unwrap_or(0) as f64 / 4.0;
                Volume::from_fn(shape, |x, y, z| {
                    let d2 = (x as f64 - center[0]).powi(2)
                        + (y as f64 - center[1]).powi(2)
                        + (z as f64 - center[2]).powi(2);
                    if d2 <= radius * radius {
                        1.0
                    } else {
                        0.0
                    }
                })
            }
        }
    }
}

/// Where the root volume comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    /// A snapshot file, relative paths resolve against the pipeline file.
    Snapshot { path: PathBuf },
    Generate(GeneratedVolume),
}

/// One operator entry and the chain of its output, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorEntry {
    #[serde(flatten)]
    pub transform: BuiltinTransform,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch: Vec<OperatorEntry>,
}

impl OperatorEntry {
    pub fn new(transform: BuiltinTransform) -> Self {
        Self {
            transform,
            branch: Vec::new(),
        }
    }
}

/// Contents of a pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub name: String,

    pub volume: VolumeSource,

    #[serde(default)]
    pub properties: VolumeProperties,

    #[serde(default)]
    pub operators: Vec<OperatorEntry>,
}

impl PipelineFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FlowError::Config(format!("Failed to parse pipeline file: {}", e)))
    }

    /// Load a pipeline file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read pipeline file {:?}", path))?;
        Self::parse(&content)
    }

    /// Save the pipeline file as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create pipeline directory".to_string())?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("Failed to serialize pipeline file: {}", e)))?;
        std::fs::write(path, content).context(format!("Failed to write {:?}", path))
    }

    /// Materialize the root volume. `base` is the directory relative
    /// snapshot paths are resolved against.
    pub fn root_volume(&self, base: &Path) -> Result<Volume> {
        match &self.volume {
            VolumeSource::Snapshot { path } => {
                let path = if path.is_relative() {
                    base.join(path)
                } else {
                    path.clone()
                };
                Volume::load(path)
            }
            VolumeSource::Generate(generated) => Ok(generated.generate()),
        }
    }

    /// Number of operators, branches included.
    pub fn operator_count(&self) -> usize {
        fn count(entries: &[OperatorEntry]) -> usize {
            entries.iter().map(|e| 1 + count(&e.branch)).sum()
        }
        count(&self.operators)
    }
}

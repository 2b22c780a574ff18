//! Script transform: evaluates a Rhai voxel script over the whole volume.
//!
//! See [`crate::scripting`] for the variables and helpers available to
//! scripts. Evaluation reads from a copy of the input so every voxel sees
//! unmodified neighbours' coordinates and the original value range.

use crate::scripting::{create_shared_cache, ScriptEngine, SharedScriptCache, VoxelContext};
use crate::transforms::{TransformContext, TransformError, TransformOutput, TransformResult};
use crate::volume::Volume;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Compiled scripts shared by every script transform in the process.
fn script_cache() -> SharedScriptCache {
    static CACHE: OnceLock<SharedScriptCache> = OnceLock::new();
    CACHE.get_or_init(create_shared_cache).clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptTransform {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ScriptTransform {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            label: None,
        }
    }

    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or("Script")
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        let engine = ScriptEngine::with_cache(script_cache());
        let script = engine
            .compile(&self.source)
            .map_err(|e| TransformError::Failed(e.to_string()))?;

        let (vmin, vmax) = volume.range().unwrap_or((0.0, 1.0));
        let voxel_ctx = VoxelContext {
            vmin: vmin as f64,
            vmax: vmax as f64,
        };
        engine
            .set_context(voxel_ctx)
            .map_err(|e| TransformError::Failed(e.to_string()))?;
        let mut scope = engine.voxel_scope(volume.shape(), voxel_ctx);

        let [nx, ny, _] = volume.shape();
        let slab = (nx * ny).max(1);
        let input = volume.data().to_vec();
        for (i, value) in input.iter().enumerate() {
            if i % slab == 0 {
                ctx.checkpoint()?;
            }
            let coords = volume.coords(i);
            let out = engine
                .eval_voxel(&script, &mut scope, *value as f64, coords)
                .map_err(|e| {
                    TransformError::Failed(format!("voxel {:?}: {}", coords, e))
                })?;
            volume.data_mut()[i] = out as f32;
        }
        Ok(TransformOutput::default())
    }
}

//! Rhai Scripting Engine for Voxel Operators
//!
//! This module provides a scripting engine based on Rhai that allows users
//! to define per-voxel transforms without writing Rust.
//!
//! ## Dynamic Variables
//!
//! The following variables are in scope for every voxel:
//!
//! - `value` - The current voxel value
//! - `x`, `y`, `z` - Integer voxel coordinates
//! - `nx`, `ny`, `nz` - Volume extents
//! - `vmin`, `vmax` - Minimum and maximum of the input volume
//!
//! ## Helper Functions
//!
//! - `clamp(value, lo, hi)` - Clamp into a range
//! - `lerp(a, b, t)` - Linear interpolation
//! - `map_range(x, in_min, in_max, out_min, out_max)` - Rescale between ranges
//! - `step(edge, x)` - 0.0 below `edge`, 1.0 otherwise
//! - `smoothstep(lo, hi, x)` - Hermite interpolation between `lo` and `hi`
//! - `normalize(value)` - Rescale `value` from `[vmin, vmax]` to `[0, 1]`
//!
//! ## Example Scripts
//!
//! Invert contrast:
//! ```rhai
//! vmax - value + vmin
//! ```
//!
//! Mask everything outside a slab:
//! ```rhai
//! if z < 4 || z > nz - 4 { 0.0 } else { value }
//! ```
//!
//! Scripts may also define `fn voxel(value)`; when present it is called
//! instead of evaluating the script body.

mod engine;

pub use engine::{ScriptEngine, VoxelContext};

use crate::error::{FlowError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled voxel script that can be executed efficiently
#[derive(Clone)]
pub struct CompiledScript {
    ast: AST,
    source: String,
    /// Whether the script defines `fn voxel(value)`.
    has_voxel_fn: bool,
}

impl CompiledScript {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    pub fn has_voxel_fn(&self) -> bool {
        self.has_voxel_fn
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("source", &self.source)
            .field("has_voxel_fn", &self.has_voxel_fn)
            .finish()
    }
}

/// Cache for compiled scripts to avoid recompilation across runs
#[derive(Default)]
pub struct ScriptCache {
    cache: HashMap<String, CompiledScript>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached script or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, source: &str) -> Result<CompiledScript> {
        if let Some(script) = self.cache.get(source) {
            return Ok(script.clone());
        }

        let ast = engine
            .compile(source)
            .map_err(|e| FlowError::Script(format!("Compilation error: {}", e)))?;
        let has_voxel_fn = ast
            .iter_functions()
            .any(|f| f.name == "voxel" && f.params.len() == 1);

        let script = CompiledScript {
            ast,
            source: source.to_string(),
            has_voxel_fn,
        };
        self.cache.insert(source.to_string(), script.clone());
        Ok(script)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.cache.contains_key(source)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Thread-safe script cache wrapper
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;

/// Create a new shared script cache
pub fn create_shared_cache() -> SharedScriptCache {
    Arc::new(RwLock::new(ScriptCache::new()))
}

/// Built-in scripts for common voxel operations
pub mod builtins {
    /// Identity - returns the voxel unchanged
    pub const IDENTITY: &str = "value";

    /// Invert contrast within the input range
    pub const INVERT: &str = "vmax - value + vmin";

    /// Normalize into [0, 1]
    pub const NORMALIZE: &str = "normalize(value)";
}

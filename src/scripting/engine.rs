//! Rhai Script Engine Implementation
//!
//! Evaluates a compiled voxel script once per voxel. Coordinates and the
//! voxel value are pushed into a reusable [`Scope`]; volume-wide statistics
//! live in a shared [`VoxelContext`] read by registered helper functions.

use crate::error::{FlowError, Result};
use crate::scripting::{create_shared_cache, CompiledScript, SharedScriptCache};
use rhai::{Dynamic, Engine, Scope};
use std::sync::{Arc, RwLock};

/// Volume-wide values visible to helper functions.
#[derive(Debug, Clone, Copy)]
pub struct VoxelContext {
    pub vmin: f64,
    pub vmax: f64,
}

impl Default for VoxelContext {
    fn default() -> Self {
        Self { vmin: 0.0, vmax: 1.0 }
    }
}

type SharedVoxelContext = Arc<RwLock<VoxelContext>>;

/// The script engine used by script operators
pub struct ScriptEngine {
    engine: Engine,
    cache: SharedScriptCache,
    context: SharedVoxelContext,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_cache(create_shared_cache())
    }

    /// Create a new script engine sharing an existing cache
    pub fn with_cache(cache: SharedScriptCache) -> Self {
        let context = Arc::new(RwLock::new(VoxelContext::default()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, context.clone());

        Self {
            engine,
            cache,
            context,
        }
    }

    /// Configure the Rhai engine with helper functions and safety limits
    fn configure_engine(engine: &mut Engine, context: SharedVoxelContext) {
        // Per-voxel budget; scripts are expressions, not programs
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(16);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(1_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(100);

        {
            let ctx = context.clone();
            engine.register_fn("normalize", move |value: f64| -> f64 {
                let (lo, hi) = ctx
                    .read()
                    .map(|c| (c.vmin, c.vmax))
                    .unwrap_or((0.0, 1.0));
                if hi > lo {
                    (value - lo) / (hi - lo)
                } else {
                    0.0
                }
            });
        }

        engine.register_fn("clamp", |x: f64, lo: f64, hi: f64| x.max(lo).min(hi));
        engine.register_fn("lerp", |a: f64, b: f64, t: f64| a + (b - a) * t);
        engine.register_fn(
            "map_range",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
            },
        );
        engine.register_fn("step", |edge: f64, x: f64| if x < edge { 0.0 } else { 1.0 });
        engine.register_fn("smoothstep", |lo: f64, hi: f64, x: f64| {
            if hi <= lo {
                return if x < lo { 0.0 } else { 1.0 };
            }
            let t = ((x - lo) / (hi - lo)).clamp(0.0, 1.0);
            t * t * (3.0 - 2.0 * t)
        });
        engine.register_fn("to_float", |x: i64| x as f64);
        engine.register_fn("pi", || std::f64::consts::PI);
    }

    /// Compile a script through the shared cache
    pub fn compile(&self, source: &str) -> Result<CompiledScript> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| FlowError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.get_or_compile(&self.engine, source)
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| FlowError::Script(format!("Validation error: {}", e)))
    }

    /// Set the volume-wide context used by helper functions.
    pub fn set_context(&self, ctx: VoxelContext) -> Result<()> {
        let mut context = self
            .context
            .write()
            .map_err(|e| FlowError::Script(format!("Failed to acquire context lock: {}", e)))?;
        *context = ctx;
        Ok(())
    }

    /// Build the per-run scope. Reuse it across voxels with [`Self::eval_voxel`].
    pub fn voxel_scope(&self, shape: [usize; 3], ctx: VoxelContext) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push("value", 0.0_f64);
        scope.push("x", 0_i64);
        scope.push("y", 0_i64);
        scope.push("z", 0_i64);
        scope.push_constant("nx", shape[0] as i64);
        scope.push_constant("ny", shape[1] as i64);
        scope.push_constant("nz", shape[2] as i64);
        scope.push_constant("vmin", ctx.vmin);
        scope.push_constant("vmax", ctx.vmax);
        scope
    }

    /// Evaluate a script for one voxel.
    pub fn eval_voxel(
        &self,
        script: &CompiledScript,
        scope: &mut Scope<'static>,
        value: f64,
        coords: (usize, usize, usize),
    ) -> Result<f64> {
        scope.set_value("value", value);
        scope.set_value("x", coords.0 as i64);
        scope.set_value("y", coords.1 as i64);
        scope.set_value("z", coords.2 as i64);

        let result = if script.has_voxel_fn() {
            self.engine
                .call_fn::<Dynamic>(scope, script.ast(), "voxel", (value,))
        } else {
            self.engine
                .eval_ast_with_scope::<Dynamic>(scope, script.ast())
        };

        let result = result.map_err(FlowError::from_rhai_error)?;
        if let Ok(f) = result.as_float() {
            Ok(f)
        } else if let Ok(i) = result.as_int() {
            Ok(i as f64)
        } else if let Ok(b) = result.as_bool() {
            Ok(if b { 1.0 } else { 0.0 })
        } else {
            Err(FlowError::Script(format!(
                "Script must return a number, got {}",
                result.type_name()
            )))
        }
    }

    /// The compiled-script cache this engine shares.
    pub fn cache(&self) -> &SharedScriptCache {
        &self.cache
    }

    /// Get a reference to the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cache_size", &self.cache.read().map(|c| c.len()).ok())
            .finish()
    }
}

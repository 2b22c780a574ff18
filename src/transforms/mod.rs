//! Transform abstraction carried by operators.
//!
//! Two-layer design:
//! - **`TransformPlugin` trait**: for user-defined transforms. Plugins run
//!   in-process only since they cannot be marshalled.
//! - **`BuiltinTransform` enum**: serializable built-ins. The same value is
//!   written into the external executor's chain description and decoded on
//!   the other side.
//!
//! `AnyTransform` wraps either variant so operators can handle both uniformly.

pub mod add_constant;
pub mod fft;
pub mod script;
pub mod threshold;

pub use add_constant::AddConstant;
pub use fft::FftAbsLog;
pub use script::ScriptTransform;
pub use threshold::Threshold;

use crate::executor::CancelToken;
use crate::volume::Volume;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a transform did not produce output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("canceled")]
    Canceled,
    #[error("{0}")]
    Failed(String),
}

/// Side output of a transform.
#[derive(Debug, Default)]
pub struct TransformOutput {
    /// Volume for the operator's explicit child data source, if it produces one.
    pub child: Option<Volume>,
}

pub type TransformResult = Result<TransformOutput, TransformError>;

/// Context passed to a transform while it runs.
pub struct TransformContext {
    token: CancelToken,
}

impl TransformContext {
    pub fn new(token: CancelToken) -> Self {
        Self { token }
    }

    /// A context that is never canceled.
    pub fn detached() -> Self {
        Self::new(CancelToken::never())
    }

    /// True once the run or this operator has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Convenience for interruptible loops: `ctx.checkpoint()?`.
    pub fn checkpoint(&self) -> Result<(), TransformError> {
        if self.is_canceled() {
            Err(TransformError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Trait for user-defined transforms.
pub trait TransformPlugin: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Transform `volume` in place.
    fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult;

    /// Whether `apply` polls [`TransformContext::is_canceled`].
    fn interruptible(&self) -> bool {
        false
    }

    /// Whether the transform fills an explicit child data source.
    fn produces_child(&self) -> bool {
        false
    }
}

/// Enum dispatch for built-in transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuiltinTransform {
    AddConstant(AddConstant),
    Threshold(Threshold),
    FftAbsLog(FftAbsLog),
    Script(ScriptTransform),
}

impl BuiltinTransform {
    pub fn name(&self) -> &str {
        match self {
            BuiltinTransform::AddConstant(t) => t.name(),
            BuiltinTransform::Threshold(t) => t.name(),
            BuiltinTransform::FftAbsLog(t) => t.name(),
            BuiltinTransform::Script(t) => t.name(),
        }
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        match self {
            BuiltinTransform::AddConstant(t) => t.apply(volume, ctx),
            BuiltinTransform::Threshold(t) => t.apply(volume, ctx),
            BuiltinTransform::FftAbsLog(t) => t.apply(volume, ctx),
            BuiltinTransform::Script(t) => t.apply(volume, ctx),
        }
    }
}

/// Wrapper that holds either a built-in transform or a plugin.
#[derive(Clone)]
pub enum AnyTransform {
    Builtin(BuiltinTransform),
    Plugin(Arc<dyn TransformPlugin>),
}

impl AnyTransform {
    pub fn name(&self) -> &str {
        match self {
            AnyTransform::Builtin(t) => t.name(),
            AnyTransform::Plugin(t) => t.name(),
        }
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        match self {
            AnyTransform::Builtin(t) => t.apply(volume, ctx),
            AnyTransform::Plugin(t) => t.apply(volume, ctx),
        }
    }

    /// Built-ins all check for cancellation between slabs.
    pub fn interruptible(&self) -> bool {
        match self {
            AnyTransform::Builtin(_) => true,
            AnyTransform::Plugin(t) => t.interruptible(),
        }
    }

    pub fn produces_child(&self) -> bool {
        match self {
            AnyTransform::Builtin(_) => false,
            AnyTransform::Plugin(t) => t.produces_child(),
        }
    }

    /// Serializable description, if this transform can leave the process.
    pub fn spec(&self) -> Option<&BuiltinTransform> {
        match self {
            AnyTransform::Builtin(t) => Some(t),
            AnyTransform::Plugin(_) => None,
        }
    }
}

impl From<BuiltinTransform> for AnyTransform {
    fn from(t: BuiltinTransform) -> Self {
        AnyTransform::Builtin(t)
    }
}

impl fmt::Debug for AnyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyTransform::Builtin(t) => f.debug_tuple("Builtin").field(t).finish(),
            AnyTransform::Plugin(t) => f.debug_tuple("Plugin").field(&t.name()).finish(),
        }
    }
}

/// Apply `f` to every voxel, checking for cancellation once per z-slab.
pub(crate) fn map_voxels(
    volume: &mut Volume,
    ctx: &TransformContext,
    mut f: impl FnMut(f32) -> f32,
) -> Result<(), TransformError> {
    let [nx, ny, _] = volume.shape();
    let slab = (nx * ny).max(1);
    for chunk in volume.data_mut().chunks_mut(slab) {
        ctx.checkpoint()?;
        for v in chunk.iter_mut() {
            *v = f(*v);
        }
    }
    Ok(())
}

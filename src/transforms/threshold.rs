//! Binary threshold: voxels inside `[lower, upper]` become `inside`, others `outside`.

use crate::transforms::{map_voxels, TransformContext, TransformOutput, TransformResult};
use crate::volume::Volume;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub lower: f64,
    pub upper: f64,
    #[serde(default = "default_inside")]
    pub inside: f64,
    #[serde(default)]
    pub outside: f64,
}

fn default_inside() -> f64 {
    1.0
}

impl Threshold {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            lower,
            upper,
            inside: default_inside(),
            outside: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        "Threshold"
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        let (lo, hi) = (self.lower as f32, self.upper as f32);
        let (inside, outside) = (self.inside as f32, self.outside as f32);
        map_voxels(volume, ctx, |v| if v >= lo && v <= hi { inside } else { outside })?;
        Ok(TransformOutput::default())
    }
}

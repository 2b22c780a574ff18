//! Add a constant to every voxel.

use crate::transforms::{map_voxels, TransformContext, TransformOutput, TransformResult};
use crate::volume::Volume;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddConstant {
    #[serde(default)]
    pub constant: f64,
}

impl AddConstant {
    pub fn new(constant: f64) -> Self {
        Self { constant }
    }

    pub fn name(&self) -> &str {
        "Add Constant"
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        let c = self.constant as f32;
        map_voxels(volume, ctx, |v| v + c)?;
        Ok(TransformOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_constant() {
        let mut vol = Volume::from_fn([3, 2, 2], |x, _, _| x as f32);
        AddConstant::new(1.5)
            .apply(&mut vol, &TransformContext::detached())
            .unwrap();
        assert_eq!(vol.get(0, 0, 0), Some(1.5));
        assert_eq!(vol.get(2, 1, 1), Some(3.5));
    }
}

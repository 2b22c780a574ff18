//! Test data builders for creating test objects

use tomoflow::executor::{PipelineExecutor, ThreadExecutor};
use tomoflow::transforms::{AddConstant, AnyTransform, BuiltinTransform, Threshold};
use tomoflow::{Pipeline, PipelineSettings, Volume, VolumeProperties};

/// Builder for pipelines over a uniform root volume
pub struct PipelineBuilder {
    shape: [usize; 3],
    value: f32,
    properties: VolumeProperties,
    executor: Option<Box<dyn PipelineExecutor>>,
    paused: bool,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            shape: [4, 4, 4],
            value: 0.0,
            properties: VolumeProperties::default(),
            executor: None,
            paused: false,
        }
    }

    pub fn shape(mut self, shape: [usize; 3]) -> Self {
        self.shape = shape;
        self
    }

    pub fn value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    pub fn properties(mut self, properties: VolumeProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn executor(mut self, executor: Box<dyn PipelineExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn build(self) -> Pipeline {
        let executor = self
            .executor
            .unwrap_or_else(|| Box::new(ThreadExecutor::new()));
        let mut pipeline = Pipeline::with_executor(
            Volume::filled(self.shape, self.value),
            self.properties,
            PipelineSettings::default(),
            executor,
        );
        if self.paused {
            pipeline.pause();
        }
        pipeline
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn add(constant: f64) -> AnyTransform {
    BuiltinTransform::AddConstant(AddConstant::new(constant)).into()
}

pub fn threshold(lower: f64, upper: f64) -> AnyTransform {
    BuiltinTransform::Threshold(Threshold::new(lower, upper)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_builder() {
        let pipeline = PipelineBuilder::new().shape([2, 2, 2]).value(3.0).paused().build();
        assert!(pipeline.paused());
        let root = pipeline.tree().ds(pipeline.root()).unwrap();
        assert_eq!(root.volume().unwrap().shape(), [2, 2, 2]);
    }
}

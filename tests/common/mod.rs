//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;
use tomoflow::pipeline::PipelineNotification;
use tomoflow::Volume;

/// How long integration tests wait for a run to settle
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Assert every voxel of `volume` equals `value`
pub fn assert_uniform(volume: &Volume, value: f32) {
    assert!(
        volume.data().iter().all(|&v| (v - value).abs() < 1e-5),
        "Expected a volume filled with {}, range is {:?}",
        value,
        volume.range()
    );
}

/// Count notifications matching `pred`
pub fn count_notifications(
    notes: &[PipelineNotification],
    pred: impl Fn(&PipelineNotification) -> bool,
) -> usize {
    notes.iter().filter(|n| pred(n)).count()
}

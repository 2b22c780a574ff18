//! FFT (log intensity).
//!
//! Takes the 3D Fourier transform of the volume and stores the log of its
//! magnitude, shifted so the zero frequency sits at the center, normalized so
//! the maximum is 1. Cancellation is checked between axis passes and slabs.

use crate::transforms::{TransformContext, TransformOutput, TransformResult};
use crate::volume::Volume;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FftAbsLog {}

impl FftAbsLog {
    pub fn name(&self) -> &str {
        "FFT (ABS LOG)"
    }

    pub fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        let shape = volume.shape();
        if volume.is_empty() {
            return Ok(TransformOutput::default());
        }

        let mut buffer: Vec<Complex<f64>> = volume
            .data()
            .iter()
            .map(|&v| Complex::new(v as f64, 0.0))
            .collect();

        let mut planner = FftPlanner::<f64>::new();
        for axis in 0..3 {
            ctx.checkpoint()?;
            fft_along_axis(&mut planner, &mut buffer, shape, axis, ctx)?;
        }

        // log|F| + eps, then fftshift
        let eps = f64::EPSILON;
        let mut output = vec![0.0_f64; buffer.len()];
        for (i, c) in buffer.iter().enumerate() {
            let (x, y, z) = volume.coords(i);
            let sx = (x + shape[0] / 2) % shape[0];
            let sy = (y + shape[1] / 2) % shape[1];
            let sz = (z + shape[2] / 2) % shape[2];
            output[volume.index(sx, sy, sz)] = (c.norm() + eps).ln();
        }

        let max = output.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let scale = if max.is_finite() && max != 0.0 { max } else { 1.0 };
        for (dst, src) in volume.data_mut().iter_mut().zip(output) {
            *dst = (src / scale) as f32;
        }
        Ok(TransformOutput::default())
    }
}

fn fft_along_axis(
    planner: &mut FftPlanner<f64>,
    buffer: &mut [Complex<f64>],
    shape: [usize; 3],
    axis: usize,
    ctx: &TransformContext,
) -> Result<(), crate::transforms::TransformError> {
    let len = shape[axis];
    if len <= 1 {
        return Ok(());
    }
    let fft = planner.plan_fft_forward(len);
    let [nx, ny, nz] = shape;

    if axis == 0 {
        // x lines are contiguous
        for slab in buffer.chunks_mut(nx * ny) {
            ctx.checkpoint()?;
            fft.process(slab);
        }
        return Ok(());
    }

    let stride = if axis == 1 { nx } else { nx * ny };
    let (outer, inner) = if axis == 1 { (nz, nx) } else { (ny, nx) };
    let mut line = vec![Complex::new(0.0, 0.0); len];
    for o in 0..outer {
        ctx.checkpoint()?;
        for i in 0..inner {
            let base = if axis == 1 { o * nx * ny + i } else { o * nx + i };
            for (k, slot) in line.iter_mut().enumerate() {
                *slot = buffer[base + k * stride];
            }
            fft.process(&mut line);
            for (k, value) in line.iter().enumerate() {
                buffer[base + k * stride] = *value;
            }
        }
    }
    Ok(())
}

//! Volumes and their physical properties.
//!
//! A [`Volume`] is an opaque dense 3D array of `f32` voxels in x-fastest
//! order. The pipeline never interprets voxel values; it only moves volumes
//! between data sources and executors. [`VolumeProperties`] carries the
//! physical spacing/units record that flows from the root to branch outputs.
//!
//! # Snapshot format
//!
//! Volumes are marshalled to disk for the external executor as:
//!
//! ```text
//! b"TFVOL001" | u32 LE header length | JSON header | f32 LE voxels
//! ```

use crate::error::{FlowError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

const SNAPSHOT_MAGIC: &[u8; 8] = b"TFVOL001";

/// Physical spacing and units associated with a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeProperties {
    /// Voxel spacing along x, y, z.
    pub spacing: [f64; 3],
    /// Length unit of `spacing` (e.g. "nm").
    pub units: String,
}

impl Default for VolumeProperties {
    fn default() -> Self {
        Self {
            spacing: [1.0, 1.0, 1.0],
            units: "nm".to_string(),
        }
    }
}

/// Dense 3D scalar volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: [usize; 3],
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    shape: [usize; 3],
    dtype: String,
}

impl Volume {
    /// Create a volume filled with `value`.
    pub fn filled(shape: [usize; 3], value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.iter().product()],
        }
    }

    /// Create a zero-filled volume.
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Wrap existing voxel data. Fails if `data.len()` does not match `shape`.
    pub fn from_data(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(FlowError::VolumeFormat(format!(
                "shape {:?} needs {} voxels, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Build a volume by evaluating `f(x, y, z)` at every voxel.
    pub fn from_fn(shape: [usize; 3], mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(shape.iter().product());
        for z in 0..shape[2] {
            for y in 0..shape[1] {
                for x in 0..shape[0] {
                    data.push(f(x, y, z));
                }
            }
        }
        Self { shape, data }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Linear index of voxel `(x, y, z)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.shape[0] * (y + self.shape[1] * z)
    }

    /// Inverse of [`Volume::index`].
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let x = index % self.shape[0];
        let rest = index / self.shape[0];
        (x, rest % self.shape[1], rest / self.shape[1])
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        if x >= self.shape[0] || y >= self.shape[1] || z >= self.shape[2] {
            return None;
        }
        self.data.get(self.index(x, y, z)).copied()
    }

    /// Minimum and maximum voxel value, or `None` for an empty volume.
    pub fn range(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    // ── Snapshot IO ──

    /// Serialize into the snapshot format.
    pub fn write_snapshot<W: Write>(&self, mut writer: W) -> Result<()> {
        let header = serde_json::to_vec(&SnapshotHeader {
            shape: self.shape,
            dtype: "f32".to_string(),
        })?;
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&(header.len() as u32).to_le_bytes())?;
        writer.write_all(&header)?;
        let mut bytes = Vec::with_capacity(self.data.len() * 4);
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Deserialize from the snapshot format.
    pub fn read_snapshot<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(FlowError::VolumeFormat("bad snapshot magic".to_string()));
        }

        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as u64;
        let mut header = Vec::new();
        (&mut reader).take(len).read_to_end(&mut header)?;
        if header.len() as u64 != len {
            return Err(FlowError::VolumeFormat("truncated snapshot header".to_string()));
        }
        let header: SnapshotHeader = serde_json::from_slice(&header)?;
        if header.dtype != "f32" {
            return Err(FlowError::VolumeFormat(format!(
                "unsupported dtype '{}'",
                header.dtype
            )));
        }

        let byte_len = header
            .shape
            .iter()
            .try_fold(4usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| {
                FlowError::VolumeFormat(format!("shape {:?} is too large", header.shape))
            })?;
        // The header is untrusted; let the payload size what gets allocated.
        let mut bytes = Vec::new();
        reader.take(byte_len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != byte_len {
            return Err(FlowError::VolumeFormat(format!(
                "truncated snapshot: expected {} bytes of voxels, got {}",
                byte_len,
                bytes.len()
            )));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_data(header.shape, data)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_snapshot(std::io::BufWriter::new(file))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Self::read_snapshot(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

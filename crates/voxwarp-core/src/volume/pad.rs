//! Zero-padding geometry: per-axis margins and the pad/crop pair.
//!
//! Padding prepends and appends zero-valued voxels per axis while shifting
//! the coordinate frame so that every retained voxel keeps its world
//! position. Cropping by the same margins is an exact inverse.

use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};

use super::Volume;

/// Six non-negative margins: low/high per axis, in voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaddingSpec {
    pub x_lo: usize,
    pub x_hi: usize,
    pub y_lo: usize,
    pub y_hi: usize,
    pub z_lo: usize,
    pub z_hi: usize,
}

impl PaddingSpec {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Uniform margin on every face.
    pub fn uniform(margin: usize) -> Self {
        Self {
            x_lo: margin,
            x_hi: margin,
            y_lo: margin,
            y_hi: margin,
            z_lo: margin,
            z_hi: margin,
        }
    }

    /// Margins in face order `[x_lo, x_hi, y_lo, y_hi, z_lo, z_hi]`.
    pub fn from_faces(faces: [usize; 6]) -> Self {
        Self {
            x_lo: faces[0],
            x_hi: faces[1],
            y_lo: faces[2],
            y_hi: faces[3],
            z_lo: faces[4],
            z_hi: faces[5],
        }
    }

    pub fn faces(&self) -> [usize; 6] {
        [
            self.x_lo, self.x_hi, self.y_lo, self.y_hi, self.z_lo, self.z_hi,
        ]
    }

    /// Low-side margins `(x, y, z)`.
    pub fn low(&self) -> [usize; 3] {
        [self.x_lo, self.y_lo, self.z_lo]
    }

    /// High-side margins `(x, y, z)`.
    pub fn high(&self) -> [usize; 3] {
        [self.x_hi, self.y_hi, self.z_hi]
    }

    /// True when any face has a nonzero margin.
    pub fn is_active(&self) -> bool {
        self.faces().iter().any(|&m| m > 0)
    }

    /// Face-wise maximum of two specs.
    pub fn max(&self, other: &PaddingSpec) -> Self {
        let a = self.faces();
        let b = other.faces();
        Self::from_faces(std::array::from_fn(|i| a[i].max(b[i])))
    }

    /// Raise every face to at least `floor`.
    pub fn with_floor(&self, floor: usize) -> Self {
        Self::from_faces(self.faces().map(|m| m.max(floor)))
    }

    /// Add `extra` to every face.
    pub fn with_extra(&self, extra: usize) -> Self {
        Self::from_faces(self.faces().map(|m| m + extra))
    }

    /// Zero the z faces, for single-slice volumes.
    pub fn without_z(&self) -> Self {
        Self {
            z_lo: 0,
            z_hi: 0,
            ..*self
        }
    }

    /// Grid dimensions after padding `dims` (`(nx, ny, nz)`).
    pub fn padded_dims(&self, dims: [usize; 3]) -> [usize; 3] {
        [
            dims[0] + self.x_lo + self.x_hi,
            dims[1] + self.y_lo + self.y_hi,
            dims[2] + self.z_lo + self.z_hi,
        ]
    }
}

impl std::fmt::Display for PaddingSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "x:{}+{} y:{}+{} z:{}+{}",
            self.x_lo, self.x_hi, self.y_lo, self.y_hi, self.z_lo, self.z_hi
        )
    }
}

/// Zero-pad `data` (`[z, y, x]` order) by the given margins.
pub fn pad_array(data: &Array3<f32>, spec: &PaddingSpec) -> Array3<f32> {
    let (nz, ny, nx) = data.dim();
    let mut out = Array3::zeros((
        nz + spec.z_lo + spec.z_hi,
        ny + spec.y_lo + spec.y_hi,
        nx + spec.x_lo + spec.x_hi,
    ));
    out.slice_mut(s![
        spec.z_lo..spec.z_lo + nz,
        spec.y_lo..spec.y_lo + ny,
        spec.x_lo..spec.x_lo + nx
    ])
    .assign(data);
    out
}

/// Remove the given margins from `data`; exact inverse of [`pad_array`].
pub fn crop_array(data: &Array3<f32>, spec: &PaddingSpec) -> Array3<f32> {
    let (nz, ny, nx) = data.dim();
    assert!(
        nx > spec.x_lo + spec.x_hi && ny > spec.y_lo + spec.y_hi && nz > spec.z_lo + spec.z_hi,
        "crop margins {spec} exceed grid {nx}x{ny}x{nz}"
    );
    data.slice(s![
        spec.z_lo..nz - spec.z_hi,
        spec.y_lo..ny - spec.y_hi,
        spec.x_lo..nx - spec.x_hi
    ])
    .to_owned()
}

impl Volume {
    /// Zero-pad by `spec`, shifting the frame so in-bounds voxels keep their
    /// world positions.
    pub fn pad(&self, spec: &PaddingSpec) -> Volume {
        Volume::new(pad_array(self.data(), spec), self.frame().grown_low(spec.low()))
    }

    /// Crop by `spec`; inverse of [`pad`](Self::pad) with the same spec.
    pub fn crop(&self, spec: &PaddingSpec) -> Volume {
        Volume::new(crop_array(self.data(), spec), self.frame().shrunk_low(spec.low()))
    }
}

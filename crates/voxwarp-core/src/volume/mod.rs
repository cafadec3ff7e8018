//! Volume type: a 3-D scalar grid plus its coordinate frame.
//!
//! Data is stored as `Array3<f32>` in `[z, y, x]` order (x fastest). Public
//! index arguments are always `(x, y, z)`.

pub mod pad;

pub use pad::PaddingSpec;

use nalgebra::Vector3;
use ndarray::{Array3, Zip};

use crate::spatial::CoordinateFrame;

/// 3-D scalar image with physical metadata.
///
/// A volume has exactly one logical owner; pipeline stages consume it by move
/// and superseded copies are dropped.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    frame: CoordinateFrame,
}

impl Volume {
    /// Wrap voxel data (`[z, y, x]` order) and a frame into a volume.
    pub fn new(data: Array3<f32>, frame: CoordinateFrame) -> Self {
        Self { data, frame }
    }

    /// All-zero volume with `(nx, ny, nz)` voxels.
    pub fn zeros(dims: [usize; 3], frame: CoordinateFrame) -> Self {
        Self::new(Array3::zeros((dims[2], dims[1], dims[0])), frame)
    }

    /// Build a volume by evaluating `f(x, y, z)` at every voxel.
    pub fn from_fn(dims: [usize; 3], frame: CoordinateFrame, f: impl Fn(usize, usize, usize) -> f32) -> Self {
        let data = Array3::from_shape_fn((dims[2], dims[1], dims[0]), |(k, j, i)| f(i, j, k));
        Self::new(data, frame)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    pub fn frame(&self) -> &CoordinateFrame {
        &self.frame
    }

    /// Replace the frame, keeping the voxel data.
    pub fn with_frame(mut self, frame: CoordinateFrame) -> Self {
        self.frame = frame;
        self
    }

    pub fn nx(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn ny(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn nz(&self) -> usize {
        self.data.shape()[0]
    }

    /// Logical dimensions `(nx, ny, nz)`.
    pub fn dims(&self) -> [usize; 3] {
        [self.nx(), self.ny(), self.nz()]
    }

    pub fn num_voxels(&self) -> usize {
        self.data.len()
    }

    pub fn value_at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    pub fn set_value(&mut self, x: usize, y: usize, z: usize, value: f32) {
        self.data[[z, y, x]] = value;
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().cloned().fold(f32::INFINITY, f32::min)
    }

    /// Replace every sample with its absolute value.
    pub fn abs_in_place(&mut self) {
        Zip::from(&mut self.data).par_for_each(|v| *v = v.abs());
    }

    /// Zero every negative sample; returns how many were clamped.
    pub fn clamp_negatives(&mut self) -> usize {
        let mut count = 0usize;
        for v in self.data.iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
                count += 1;
            }
        }
        count
    }

    /// True when the two volumes share grid dimensions and coordinate frame.
    pub fn same_grid_as(&self, other: &Volume) -> bool {
        self.dims() == other.dims()
            && crate::spatial::grid_offset(self.frame(), other.frame())
                .is_some_and(|o| o == Vector3::zeros())
    }

    /// True when dimensions, frame and every sample agree exactly.
    pub fn identical_to(&self, other: &Volume) -> bool {
        self.same_grid_as(other) && self.data == other.data
    }

    /// Sample with trilinear interpolation at a continuous `(x, y, z)` index,
    /// clamped to the grid.
    pub fn sample_linear(&self, x: f64, y: f64, z: f64) -> f32 {
        crate::interpolation::sample_linear(&self.data, x, y, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dims_follow_xyz_convention() {
        let vol = Volume::zeros([4, 5, 6], CoordinateFrame::identity());
        assert_eq!(vol.nx(), 4);
        assert_eq!(vol.ny(), 5);
        assert_eq!(vol.nz(), 6);
        assert_eq!(vol.data().shape(), &[6, 5, 4]);
    }

    #[test]
    fn test_from_fn_indexing() {
        let vol = Volume::from_fn([3, 4, 5], CoordinateFrame::identity(), |x, y, z| {
            (x + 10 * y + 100 * z) as f32
        });
        assert_eq!(vol.value_at(2, 3, 4), 432.0);
        assert_eq!(vol.value_at(0, 0, 0), 0.0);
    }

    #[test]
    fn test_abs_and_clamp() {
        let mut vol = Volume::from_fn([2, 2, 2], CoordinateFrame::identity(), |x, _, _| {
            if x == 0 { -2.0 } else { 3.0 }
        });
        let n = vol.clone().clamp_negatives();
        assert_eq!(n, 4);
        vol.abs_in_place();
        assert_eq!(vol.value_at(0, 0, 0), 2.0);
        assert_eq!(vol.min_value(), 2.0);
    }

    #[test]
    fn test_same_grid_detects_frame_shift() {
        let a = Volume::zeros([4, 4, 4], CoordinateFrame::identity());
        let b = Volume::zeros([4, 4, 4], CoordinateFrame::identity().grown_low([1, 0, 0]));
        assert!(!a.same_grid_as(&b));
        assert!(a.same_grid_as(&a.clone()));
    }
}

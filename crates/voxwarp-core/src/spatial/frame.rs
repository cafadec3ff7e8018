//! Coordinate frame: the index↔world affine pair of a voxel grid.
//!
//! A frame is deliberately separate from any voxel data. Volumes and warp
//! fields carry one; grid-only warp fields adopt one explicitly at output
//! boundaries.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Mapping between continuous voxel indices and world coordinates.
///
/// The forward mapping is `world = origin + direction * (index .* spacing)`;
/// the two 4×4 matrices exposed here are mutually inverse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateFrame {
    origin: Point3<f64>,
    spacing: Vector3<f64>,
    direction: Matrix3<f64>,
}

impl CoordinateFrame {
    /// Create a frame from origin, per-axis spacing and a direction matrix.
    ///
    /// Spacing components must be positive; the direction matrix must be
    /// invertible (it is a rotation for well-formed inputs).
    pub fn new(origin: Point3<f64>, spacing: Vector3<f64>, direction: Matrix3<f64>) -> Self {
        assert!(
            spacing.iter().all(|&s| s > 0.0),
            "voxel spacing must be positive, got {:?}",
            spacing
        );
        Self {
            origin,
            spacing,
            direction,
        }
    }

    /// Axis-aligned frame with the given spacing, origin at zero.
    pub fn axis_aligned(spacing: [f64; 3]) -> Self {
        Self::new(
            Point3::origin(),
            Vector3::from(spacing),
            Matrix3::identity(),
        )
    }

    /// Unit-spacing axis-aligned frame, origin at zero.
    pub fn identity() -> Self {
        Self::axis_aligned([1.0, 1.0, 1.0])
    }

    pub fn origin(&self) -> Point3<f64> {
        self.origin
    }

    pub fn spacing(&self) -> Vector3<f64> {
        self.spacing
    }

    pub fn direction(&self) -> Matrix3<f64> {
        self.direction
    }

    /// Smallest spacing component, used to normalize world-space shifts.
    pub fn min_spacing(&self) -> f64 {
        self.spacing.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    /// Map a continuous index `(x, y, z)` to a world point.
    pub fn index_to_world(&self, index: Vector3<f64>) -> Point3<f64> {
        let scaled = index.component_mul(&self.spacing);
        self.origin + self.direction * scaled
    }

    /// Map a world point back to a continuous index `(x, y, z)`.
    pub fn world_to_index(&self, point: Point3<f64>) -> Vector3<f64> {
        let inv_dir = self
            .direction
            .try_inverse()
            .expect("direction matrix must be invertible");
        let rotated = inv_dir * (point - self.origin);
        rotated.component_div(&self.spacing)
    }

    /// Homogeneous 4×4 matrix for `index_to_world`.
    pub fn index_to_world_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        for c in 0..3 {
            for r in 0..3 {
                m[(r, c)] = self.direction[(r, c)] * self.spacing[c];
            }
            m[(c, 3)] = self.origin[c];
        }
        m
    }

    /// Homogeneous 4×4 matrix for `world_to_index`; inverse of
    /// [`index_to_world_matrix`](Self::index_to_world_matrix).
    pub fn world_to_index_matrix(&self) -> Matrix4<f64> {
        self.index_to_world_matrix()
            .try_inverse()
            .expect("index-to-world matrix must be invertible")
    }

    /// Frame of the same grid grown by `low` voxels on the low side of each
    /// axis (x, y, z): the new origin is the world position of old index
    /// `(-low[0], -low[1], -low[2])`.
    pub fn grown_low(&self, low: [usize; 3]) -> Self {
        let shift = Vector3::new(-(low[0] as f64), -(low[1] as f64), -(low[2] as f64));
        Self {
            origin: self.index_to_world(shift),
            spacing: self.spacing,
            direction: self.direction,
        }
    }

    /// Frame of the same grid shrunk by `low` voxels on the low side of each
    /// axis; inverse of [`grown_low`](Self::grown_low).
    pub fn shrunk_low(&self, low: [usize; 3]) -> Self {
        let shift = Vector3::new(low[0] as f64, low[1] as f64, low[2] as f64);
        Self {
            origin: self.index_to_world(shift),
            spacing: self.spacing,
            direction: self.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_index_world_roundtrip() {
        let frame = CoordinateFrame::new(
            Point3::new(10.0, -20.0, 5.0),
            Vector3::new(1.5, 2.0, 3.0),
            Matrix3::identity(),
        );
        let index = Vector3::new(3.5, 4.25, 5.75);
        let world = frame.index_to_world(index);
        let back = frame.world_to_index(world);
        assert_relative_eq!(back, index, epsilon = 1e-12);
    }

    #[test]
    fn test_matrices_are_inverse_pair() {
        let frame = CoordinateFrame::new(
            Point3::new(1.0, 2.0, 3.0),
            Vector3::new(0.8, 1.0, 1.2),
            Matrix3::identity(),
        );
        let product = frame.index_to_world_matrix() * frame.world_to_index_matrix();
        assert_relative_eq!(product, Matrix4::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_grown_low_shifts_origin() {
        let frame = CoordinateFrame::axis_aligned([2.0, 2.0, 2.0]);
        let grown = frame.grown_low([3, 0, 1]);
        assert_relative_eq!(grown.origin(), Point3::new(-6.0, 0.0, -2.0), epsilon = 1e-12);
        // Old index 0 sits at grown index 3 along x.
        let idx = grown.world_to_index(frame.index_to_world(Vector3::zeros()));
        assert_relative_eq!(idx, Vector3::new(3.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_grown_shrunk_roundtrip() {
        let frame = CoordinateFrame::new(
            Point3::new(-4.0, 7.0, 0.5),
            Vector3::new(1.0, 1.5, 2.5),
            Matrix3::identity(),
        );
        let back = frame.grown_low([2, 5, 9]).shrunk_low([2, 5, 9]);
        assert_relative_eq!(back.origin(), frame.origin(), epsilon = 1e-12);
    }
}

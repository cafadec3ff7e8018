//! 4×4 affine transforms in world coordinates.

use nalgebra::{Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::spatial::CoordinateFrame;

/// Homogeneous 4×4 affine transform.
///
/// Affine matrices live in world coordinates; [`to_index_space`] rebinds one
/// to a grid through the grid's index↔world conversion pair.
///
/// [`to_index_space`]: Self::to_index_space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineMatrix(pub Matrix4<f64>);

impl AffineMatrix {
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    /// Build from the first three rows (12 values, row-major); the fourth row
    /// is `0 0 0 1`. This is the layout of affine-registration matrix files.
    pub fn from_rows_3x4(values: [f64; 12]) -> Self {
        let mut m = Matrix4::identity();
        for r in 0..3 {
            for c in 0..4 {
                m[(r, c)] = values[4 * r + c];
            }
        }
        Self(m)
    }

    pub fn from_translation(t: Vector3<f64>) -> Self {
        Self(Matrix4::new_translation(&t))
    }

    /// Translation component.
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.0[(0, 3)], self.0[(1, 3)], self.0[(2, 3)])
    }

    /// Apply to a 3-vector (point), homogeneous weight 1.
    pub fn transform(&self, v: Vector3<f64>) -> Vector3<f64> {
        let h = self.0 * Vector4::new(v.x, v.y, v.z, 1.0);
        Vector3::new(h.x, h.y, h.z)
    }

    /// Rebind this world-space transform into the index space of `frame`:
    /// `imat * M * cmat`, where `cmat`/`imat` are the frame's index↔world
    /// matrix pair.
    pub fn to_index_space(&self, frame: &CoordinateFrame) -> AffineMatrix {
        AffineMatrix(frame.world_to_index_matrix() * self.0 * frame.index_to_world_matrix())
    }

    pub fn compose(&self, other: &AffineMatrix) -> AffineMatrix {
        AffineMatrix(self.0 * other.0)
    }

    pub fn try_inverse(&self) -> Option<AffineMatrix> {
        self.0.try_inverse().map(AffineMatrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_rows_layout() {
        let m = AffineMatrix::from_rows_3x4([
            1.0, 0.0, 0.0, 5.0, //
            0.0, 1.0, 0.0, -3.0, //
            0.0, 0.0, 1.0, 2.0,
        ]);
        assert_relative_eq!(m.translation(), Vector3::new(5.0, -3.0, 2.0));
        assert_relative_eq!(
            m.transform(Vector3::new(1.0, 1.0, 1.0)),
            Vector3::new(6.0, -2.0, 3.0)
        );
    }

    #[test]
    fn test_index_space_translation_scales_with_spacing() {
        // A world translation of 4 mm along x is 2 voxels at 2 mm spacing.
        let frame = CoordinateFrame::axis_aligned([2.0, 2.0, 2.0]);
        let m = AffineMatrix::from_translation(Vector3::new(4.0, 0.0, 0.0));
        let idx = m.to_index_space(&frame);
        assert_relative_eq!(
            idx.transform(Vector3::zeros()),
            Vector3::new(2.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_index_space_identity_roundtrip() {
        let frame = CoordinateFrame::new(
            nalgebra::Point3::new(3.0, -7.0, 11.0),
            Vector3::new(0.5, 1.25, 2.0),
            nalgebra::Matrix3::identity(),
        );
        let idx = AffineMatrix::identity().to_index_space(&frame);
        assert_relative_eq!(idx.0, Matrix4::identity(), epsilon = 1e-9);
    }
}

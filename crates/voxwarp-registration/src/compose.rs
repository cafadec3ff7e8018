//! Warp composition: affine-then-warp, inversion, grid reconciliation.
//!
//! # Symmetric (plusminus) relation
//!
//! For the two warps of a symmetric solve meeting at a midpoint,
//! `base(x − Wminus(x))` matches `source(x + Wplus(x))`. The standard single
//! warp `V` relates by `V(x) = Wplus(Inverse(Wminus(x)))`; given `V` with
//! midpoint `Vh(x) = x + ½·displacement(V, x)`, the plus warp is
//! `Wplus(x) = V(Inverse(Vh(x)))`. This is an interoperability contract for
//! consumers of the paired outputs; nothing here computes it.

use nalgebra::Vector3;
use tracing::debug;

use voxwarp_core::spatial::CoordinateFrame;
use voxwarp_core::transform::{AffineMatrix, WarpField};
use voxwarp_core::volume::PaddingSpec;

use crate::error::{PipelineError, Result};

/// Iteration cap for fixed-point warp inversion.
const INVERT_MAX_ITER: usize = 50;
/// Convergence tolerance for inversion, in voxels.
const INVERT_TOL: f64 = 0.01;

/// Compose a world-space affine as the leading transform of `warp`,
/// producing one field on `warp`'s grid that maps through the affine first.
///
/// The matrix is rebound into index space through `frame`'s index↔world
/// conversion pair; the composed displacement is
/// `d'(x) = A_idx(x + d(x)) − x`. Catenating the affine with the result
/// downstream would double-apply the affine step.
pub fn compose_affine_then_warp(
    matrix: &AffineMatrix,
    warp: &WarpField,
    frame: &CoordinateFrame,
) -> WarpField {
    let a_idx = matrix.to_index_space(frame);
    let [nx, ny, nz] = warp.dims();
    let mut out = WarpField::zeros(warp.dims());
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let x = Vector3::new(i as f64, j as f64, k as f64);
                let mapped = a_idx.transform(x + warp.displacement_at(i, j, k));
                let d = mapped - x;
                out.set_displacement(i, j, k, [d.x as f32, d.y as f32, d.z as f32]);
            }
        }
    }
    match warp.frame() {
        Some(f) => out.adopt_frame(*f),
        None => out.adopt_frame(*frame),
    }
}

/// Invert a warp by fixed-point iteration: `d_inv(x) ← −d(x + d_inv(x))`.
///
/// Invertibility is assumed, not guaranteed; a field that folds over has no
/// inverse and surfaces here as a computation error rather than a silently
/// degenerate result.
pub fn invert(warp: &WarpField) -> Result<WarpField> {
    let [nx, ny, nz] = warp.dims();
    let mut inv = WarpField::zeros(warp.dims());

    let mut last_change = f64::INFINITY;
    for iter in 0..INVERT_MAX_ITER {
        let mut change: f64 = 0.0;
        let mut next = WarpField::zeros(warp.dims());
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let cur = inv.displacement_at(i, j, k);
                    let p = Vector3::new(i as f64 + cur.x, j as f64 + cur.y, k as f64 + cur.z);
                    let d = -warp.sample_displacement(p.x, p.y, p.z);
                    change = change.max((d - cur).amax());
                    next.set_displacement(i, j, k, [d.x as f32, d.y as f32, d.z as f32]);
                }
            }
        }
        inv = next;
        if change <= INVERT_TOL {
            debug!(iter, change, "warp inversion converged");
            let inv = match warp.frame() {
                Some(f) => inv.adopt_frame(*f),
                None => inv,
            };
            return Ok(inv);
        }
        last_change = change;
    }
    Err(PipelineError::computation(format!(
        "warp inversion did not converge (residual {last_change:.3} voxels); \
         the field may fold over"
    )))
}

/// Extend a warp's grid by per-axis margins (linear extrapolation).
pub fn extend(warp: &WarpField, margins: &PaddingSpec) -> WarpField {
    warp.extend(margins)
}

/// Truncate a warp's grid by per-axis margins.
pub fn crop(warp: &WarpField, margins: &PaddingSpec) -> WarpField {
    warp.crop(margins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_warp_with_translation_is_pure_translation() {
        let frame = CoordinateFrame::identity();
        let warp = WarpField::zeros([12, 12, 12]).adopt_frame(frame);
        let matrix = AffineMatrix::from_translation(Vector3::new(3.0, -2.0, 1.0));

        let composed = compose_affine_then_warp(&matrix, &warp, &frame);
        for &(x, y, z) in &[(0usize, 0usize, 0usize), (5, 7, 2), (11, 11, 11)] {
            let d = composed.displacement_at(x, y, z);
            assert_relative_eq!(d, Vector3::new(3.0, -2.0, 1.0), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_translation_scales_into_index_space() {
        // 2 mm spacing: a 4 mm world translation is 2 voxels.
        let frame = CoordinateFrame::axis_aligned([2.0, 2.0, 2.0]);
        let warp = WarpField::zeros([8, 8, 8]).adopt_frame(frame);
        let matrix = AffineMatrix::from_translation(Vector3::new(4.0, 0.0, 0.0));
        let composed = compose_affine_then_warp(&matrix, &warp, &frame);
        let d = composed.displacement_at(3, 3, 3);
        assert_relative_eq!(d, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_affine_applies_after_warp_displacement() {
        // A warp of +1 voxel in x through a scaling matrix: the displacement
        // is evaluated before the matrix.
        let frame = CoordinateFrame::identity();
        let mut warp = WarpField::zeros([6, 6, 6]);
        for k in 0..6 {
            for j in 0..6 {
                for i in 0..6 {
                    warp.set_displacement(i, j, k, [1.0, 0.0, 0.0]);
                }
            }
        }
        let warp = warp.adopt_frame(frame);
        let mut m = nalgebra::Matrix4::identity();
        m[(0, 0)] = 2.0;
        let composed = compose_affine_then_warp(&AffineMatrix(m), &warp, &frame);
        // x=2: mapped = 2*(2+1) = 6, displacement = 4.
        assert_relative_eq!(composed.displacement_at(2, 0, 0).x, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invert_uniform_shift() {
        let mut warp = WarpField::zeros([10, 10, 10]);
        for k in 0..10 {
            for j in 0..10 {
                for i in 0..10 {
                    warp.set_displacement(i, j, k, [2.0, -1.0, 0.5]);
                }
            }
        }
        let inv = invert(&warp).unwrap();
        let d = inv.displacement_at(5, 5, 5);
        assert_relative_eq!(d, Vector3::new(-2.0, 1.0, -0.5), epsilon = 1e-2);
        // Composition is close to identity at an interior point.
        let round = WarpField::compose(&warp, &inv);
        assert!(round.displacement_at(5, 5, 5).norm() < 0.05);
    }

    #[test]
    fn test_invert_smooth_field() {
        let mut warp = WarpField::zeros([16, 16, 16]);
        for k in 0..16 {
            for j in 0..16 {
                for i in 0..16 {
                    // Small smooth displacement, well away from folding.
                    let d = ((i as f32 - 8.0) / 8.0).sin() * 0.8;
                    warp.set_displacement(i, j, k, [d, 0.0, 0.0]);
                }
            }
        }
        let inv = invert(&warp).unwrap();
        let round = WarpField::compose(&warp, &inv);
        assert!(round.displacement_at(8, 8, 8).norm() < 0.05);
    }
}

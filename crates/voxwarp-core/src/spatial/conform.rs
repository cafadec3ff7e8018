//! Grid conformance: deciding whether one grid is an integer-offset
//! enlargement of another.
//!
//! Used to reconcile a pre-supplied initial warp with the base grid: the warp
//! may live on a larger grid, but only one whose voxels line up exactly with
//! the base voxels.

use nalgebra::Vector3;
use thiserror::Error;

use super::frame::CoordinateFrame;

/// Tolerance for "lines up exactly", in voxels.
const INDEX_TOL: f64 = 1e-3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridConformError {
    #[error("grids do not conform: {0}")]
    NotConforming(String),

    #[error("grid conforms to but does not contain the reference grid")]
    DoesNotContain,
}

/// Index offset of `inner`'s first voxel inside `outer`'s grid, if the two
/// grids share spacing and orientation and line up on whole voxels.
pub fn grid_offset(outer: &CoordinateFrame, inner: &CoordinateFrame) -> Option<Vector3<i64>> {
    let ds = outer.spacing() - inner.spacing();
    if ds.amax() > INDEX_TOL * outer.min_spacing() {
        return None;
    }
    let dd = outer.direction() - inner.direction();
    if dd.amax() > INDEX_TOL {
        return None;
    }

    let offset = outer.world_to_index(inner.origin());
    let rounded = offset.map(f64::round);
    if (offset - rounded).amax() > INDEX_TOL {
        return None;
    }
    Some(Vector3::new(
        rounded[0] as i64,
        rounded[1] as i64,
        rounded[2] as i64,
    ))
}

/// Per-face margins `[x_lo, x_hi, y_lo, y_hi, z_lo, z_hi]` by which the
/// `outer` grid exceeds the `inner` one.
///
/// Dims are `(nx, ny, nz)`. Fails if the grids do not share voxels, or if
/// `outer` does not fully contain `inner`.
pub fn conform_margins(
    outer: (&CoordinateFrame, [usize; 3]),
    inner: (&CoordinateFrame, [usize; 3]),
) -> Result<[usize; 6], GridConformError> {
    let (outer_frame, outer_dims) = outer;
    let (inner_frame, inner_dims) = inner;

    let offset = grid_offset(outer_frame, inner_frame).ok_or_else(|| {
        GridConformError::NotConforming(
            "spacing, orientation or voxel alignment differ".to_string(),
        )
    })?;

    let mut margins = [0usize; 6];
    for axis in 0..3 {
        let lo = offset[axis];
        let hi = outer_dims[axis] as i64 - inner_dims[axis] as i64 - lo;
        if lo < 0 || hi < 0 {
            return Err(GridConformError::DoesNotContain);
        }
        margins[2 * axis] = lo as usize;
        margins[2 * axis + 1] = hi as usize;
    }
    Ok(margins)
}

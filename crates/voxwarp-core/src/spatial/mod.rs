//! Spatial types: coordinate frames and grid conformance checks.
//!
//! All geometry is `f64` via nalgebra; voxel data stays `f32`.

pub mod conform;
pub mod frame;

pub use conform::{conform_margins, grid_offset, GridConformError};
pub use frame::CoordinateFrame;

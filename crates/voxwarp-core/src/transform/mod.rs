//! Spatial transforms: affine matrices and dense warp fields.

pub mod affine;
pub mod warp;

pub use affine::AffineMatrix;
pub use warp::WarpField;

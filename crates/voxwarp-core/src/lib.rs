pub mod filter;
pub mod interpolation;
pub mod mask;
pub mod spatial;
pub mod transform;
pub mod volume;

pub use spatial::CoordinateFrame;
pub use transform::{AffineMatrix, WarpField};
pub use volume::{PaddingSpec, Volume};

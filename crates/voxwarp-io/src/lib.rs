pub mod matrix_io;
pub mod nifti_io;

pub use matrix_io::read_affine_matrix;
pub use nifti_io::{
    read_volume, read_warp, write_volume, write_volume_tagged, write_warp, write_warp_tagged,
};

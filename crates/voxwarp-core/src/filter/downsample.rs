//! Block-average downsampling used by the half-resolution solve path.

use nalgebra::Vector3;
use ndarray::Array3;

use crate::spatial::CoordinateFrame;
use crate::volume::Volume;

/// Downsample by a factor of two per axis, averaging each 2×2×2 block.
///
/// Odd trailing samples form partial blocks. The result's frame doubles the
/// spacing and moves the origin to the center of the first block.
pub fn downsample_by_two(volume: &Volume) -> Volume {
    let (nz, ny, nx) = volume.data().dim();
    let (mz, my, mx) = (nz.div_ceil(2), ny.div_ceil(2), nx.div_ceil(2));

    let data = volume.data();
    let out = Array3::from_shape_fn((mz, my, mx), |(k, j, i)| {
        let mut sum = 0.0f32;
        let mut count = 0u32;
        for dz in 0..2 {
            for dy in 0..2 {
                for dx in 0..2 {
                    let (kk, jj, ii) = (2 * k + dz, 2 * j + dy, 2 * i + dx);
                    if kk < nz && jj < ny && ii < nx {
                        sum += data[[kk, jj, ii]];
                        count += 1;
                    }
                }
            }
        }
        sum / count as f32
    });

    let frame = volume.frame();
    let origin = frame.index_to_world(Vector3::new(0.5, 0.5, 0.5));
    let coarse = CoordinateFrame::new(origin, frame.spacing() * 2.0, frame.direction());
    Volume::new(out, coarse)
}

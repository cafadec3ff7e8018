//! Median filter over a spherical voxel neighborhood.
//!
//! Used to smash localized spikes before Gaussian smoothing in the weight
//! path. An optional support mask restricts both which voxels are filtered
//! and which neighbors contribute.

use ndarray::parallel::prelude::*;
use ndarray::{Array3, Axis};

use crate::volume::Volume;

/// Offsets within a sphere of the given radius (voxels), center included.
fn sphere_offsets(radius: f64) -> Vec<(isize, isize, isize)> {
    let r = radius.floor() as isize;
    let r2 = radius * radius;
    let mut offsets = Vec::new();
    for dz in -r..=r {
        for dy in -r..=r {
            for dx in -r..=r {
                let d2 = (dx * dx + dy * dy + dz * dz) as f64;
                if d2 <= r2 {
                    offsets.push((dz, dy, dx));
                }
            }
        }
    }
    offsets
}

fn median_of(values: &mut Vec<f32>) -> f32 {
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *m
}

/// Median-filter `data` (`[z, y, x]` order) over a sphere of `radius` voxels.
///
/// With a mask, voxels outside it are copied through unchanged and neighbors
/// outside it do not contribute.
pub fn median_filter_array(
    data: &Array3<f32>,
    radius: f64,
    mask: Option<&Array3<bool>>,
) -> Array3<f32> {
    let offsets = sphere_offsets(radius);
    if offsets.len() <= 1 {
        return data.clone();
    }
    let (nz, ny, nx) = data.dim();
    let mut out = data.clone();

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(k, mut slab)| {
            let mut values = Vec::with_capacity(offsets.len());
            for j in 0..ny {
                for i in 0..nx {
                    if let Some(m) = mask {
                        if !m[[k, j, i]] {
                            continue;
                        }
                    }
                    values.clear();
                    for &(dz, dy, dx) in &offsets {
                        let kk = k as isize + dz;
                        let jj = j as isize + dy;
                        let ii = i as isize + dx;
                        if kk < 0 || jj < 0 || ii < 0 {
                            continue;
                        }
                        let (kk, jj, ii) = (kk as usize, jj as usize, ii as usize);
                        if kk >= nz || jj >= ny || ii >= nx {
                            continue;
                        }
                        if let Some(m) = mask {
                            if !m[[kk, jj, ii]] {
                                continue;
                            }
                        }
                        values.push(data[[kk, jj, ii]]);
                    }
                    if !values.is_empty() {
                        slab[[j, i]] = median_of(&mut values);
                    }
                }
            }
        });
    out
}

/// Median-filter a volume, preserving its frame.
pub fn median_filter(volume: &Volume, radius: f64, mask: Option<&Array3<bool>>) -> Volume {
    Volume::new(
        median_filter_array(volume.data(), radius, mask),
        *volume.frame(),
    )
}

//! Byte-mask morphology and robust intensity statistics.
//!
//! These are the building blocks of the weight path: clip-level estimation,
//! thresholding, largest-cluster extraction, erosion, dilation and
//! single-voxel fill-in, plus nonzero bounding boxes.

use ndarray::Array3;

/// Inclusive bounding box in `(x, y, z)` voxel indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub lo: [usize; 3],
    pub hi: [usize; 3],
}

impl BoundingBox {
    /// Extent along an axis, in voxels.
    pub fn extent(&self, axis: usize) -> usize {
        self.hi[axis] - self.lo[axis] + 1
    }

    /// Grow by `margin` per face, clamping to `[min_index, dims - 1 - min_index]`.
    pub fn grown_clamped(&self, margin: usize, min_index: usize, dims: [usize; 3]) -> Self {
        let mut lo = self.lo;
        let mut hi = self.hi;
        for axis in 0..3 {
            lo[axis] = lo[axis].saturating_sub(margin).max(min_index);
            hi[axis] = (hi[axis] + margin).min(dims[axis].saturating_sub(1 + min_index));
        }
        Self { lo, hi }
    }
}

/// Robust clip level: the `frac`-quantile of the strictly positive samples.
///
/// Returns 0 when no sample is positive.
pub fn clip_level(data: &Array3<f32>, frac: f64) -> f32 {
    let mut positives: Vec<f32> = data.iter().cloned().filter(|&v| v > 0.0).collect();
    if positives.is_empty() {
        return 0.0;
    }
    let idx = ((positives.len() - 1) as f64 * frac.clamp(0.0, 1.0)).round() as usize;
    let (_, v, _) = positives.select_nth_unstable_by(idx, |a, b| a.total_cmp(b));
    *v
}

/// Mask of samples at or above `threshold`.
pub fn threshold_mask(data: &Array3<f32>, threshold: f32) -> Array3<bool> {
    data.mapv(|v| v >= threshold)
}

/// Mask of strictly positive samples.
pub fn positive_mask(data: &Array3<f32>) -> Array3<bool> {
    data.mapv(|v| v > 0.0)
}

/// Keep only the largest 6-connected set component; all-false input stays
/// all-false.
pub fn largest_cluster(mask: &Array3<bool>) -> Array3<bool> {
    let (nz, ny, nx) = mask.dim();
    let mut labels: Array3<u32> = Array3::zeros((nz, ny, nx));
    let mut best_label = 0u32;
    let mut best_size = 0usize;
    let mut next_label = 0u32;
    let mut stack: Vec<(usize, usize, usize)> = Vec::new();

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if !mask[[k, j, i]] || labels[[k, j, i]] != 0 {
                    continue;
                }
                next_label += 1;
                let mut size = 0usize;
                stack.push((k, j, i));
                labels[[k, j, i]] = next_label;
                while let Some((ck, cj, ci)) = stack.pop() {
                    size += 1;
                    let neighbors = [
                        (ck.wrapping_sub(1), cj, ci),
                        (ck + 1, cj, ci),
                        (ck, cj.wrapping_sub(1), ci),
                        (ck, cj + 1, ci),
                        (ck, cj, ci.wrapping_sub(1)),
                        (ck, cj, ci + 1),
                    ];
                    for (qk, qj, qi) in neighbors {
                        if qk < nz && qj < ny && qi < nx
                            && mask[[qk, qj, qi]]
                            && labels[[qk, qj, qi]] == 0
                        {
                            labels[[qk, qj, qi]] = next_label;
                            stack.push((qk, qj, qi));
                        }
                    }
                }
                if size > best_size {
                    best_size = size;
                    best_label = next_label;
                }
            }
        }
    }

    labels.mapv(|l| l != 0 && l == best_label)
}

/// One erosion pass: a voxel survives only if all six face neighbors are set
/// (out-of-bounds counts as unset).
pub fn erode(mask: &Array3<bool>) -> Array3<bool> {
    let (nz, ny, nx) = mask.dim();
    Array3::from_shape_fn((nz, ny, nx), |(k, j, i)| {
        if !mask[[k, j, i]] {
            return false;
        }
        k > 0
            && k + 1 < nz
            && j > 0
            && j + 1 < ny
            && i > 0
            && i + 1 < nx
            && mask[[k - 1, j, i]]
            && mask[[k + 1, j, i]]
            && mask[[k, j - 1, i]]
            && mask[[k, j + 1, i]]
            && mask[[k, j, i - 1]]
            && mask[[k, j, i + 1]]
    })
}

/// One dilation pass: an unset voxel becomes set when at least
/// `min_neighbors` of its 18-neighborhood are set.
pub fn dilate(mask: &Array3<bool>, min_neighbors: usize) -> Array3<bool> {
    let (nz, ny, nx) = mask.dim();
    Array3::from_shape_fn((nz, ny, nx), |(k, j, i)| {
        if mask[[k, j, i]] {
            return true;
        }
        let mut count = 0usize;
        for dz in -1isize..=1 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    // 18-neighborhood: exclude center and full corners.
                    let manhattan = dz.abs() + dy.abs() + dx.abs();
                    if manhattan == 0 || manhattan == 3 {
                        continue;
                    }
                    let (kk, jj, ii) = (k as isize + dz, j as isize + dy, i as isize + dx);
                    if kk >= 0
                        && jj >= 0
                        && ii >= 0
                        && (kk as usize) < nz
                        && (jj as usize) < ny
                        && (ii as usize) < nx
                        && mask[[kk as usize, jj as usize, ii as usize]]
                    {
                        count += 1;
                    }
                }
            }
        }
        count >= min_neighbors
    })
}

/// Fill single-voxel gaps: an unset voxel becomes set when both immediate
/// neighbors along some axis are set.
pub fn fill_in_once(mask: &Array3<bool>) -> Array3<bool> {
    let (nz, ny, nx) = mask.dim();
    Array3::from_shape_fn((nz, ny, nx), |(k, j, i)| {
        if mask[[k, j, i]] {
            return true;
        }
        (i > 0 && i + 1 < nx && mask[[k, j, i - 1]] && mask[[k, j, i + 1]])
            || (j > 0 && j + 1 < ny && mask[[k, j - 1, i]] && mask[[k, j + 1, i]])
            || (k > 0 && k + 1 < nz && mask[[k - 1, j, i]] && mask[[k + 1, j, i]])
    })
}

/// Bounding box of nonzero samples, `None` for an all-zero array.
pub fn auto_bbox(data: &Array3<f32>) -> Option<BoundingBox> {
    let (nz, ny, nx) = data.dim();
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut any = false;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if data[[k, j, i]] != 0.0 {
                    any = true;
                    let idx = [i, j, k];
                    for axis in 0..3 {
                        lo[axis] = lo[axis].min(idx[axis]);
                        hi[axis] = hi[axis].max(idx[axis]);
                    }
                }
            }
        }
    }
    any.then_some(BoundingBox { lo, hi })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_mask(dims: (usize, usize, usize), lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn(dims, |(k, j, i)| {
            (lo..=hi).contains(&i) && (lo..=hi).contains(&j) && (lo..=hi).contains(&k)
        })
    }

    #[test]
    fn test_clip_level_quantiles() {
        let data = Array3::from_shape_fn((1, 1, 100), |(_, _, i)| (i + 1) as f32);
        assert_eq!(clip_level(&data, 0.0), 1.0);
        assert_eq!(clip_level(&data, 1.0), 100.0);
        let mid = clip_level(&data, 0.5);
        assert!((49.0..=51.0).contains(&mid), "mid {mid}");
    }

    #[test]
    fn test_clip_level_ignores_nonpositive() {
        let mut data = Array3::from_elem((2, 2, 2), -1.0f32);
        data[[0, 0, 0]] = 5.0;
        assert_eq!(clip_level(&data, 0.5), 5.0);
        assert_eq!(clip_level(&Array3::zeros((2, 2, 2)), 0.5), 0.0);
    }

    #[test]
    fn test_largest_cluster_keeps_biggest() {
        let mut mask = Array3::from_elem((8, 8, 8), false);
        // Big 3x3x3 component.
        for k in 1..4 {
            for j in 1..4 {
                for i in 1..4 {
                    mask[[k, j, i]] = true;
                }
            }
        }
        // Small disconnected voxel.
        mask[[6, 6, 6]] = true;
        let out = largest_cluster(&mask);
        assert!(out[[2, 2, 2]]);
        assert!(!out[[6, 6, 6]]);
    }

    #[test]
    fn test_erode_strips_one_shell() {
        let mask = cube_mask((9, 9, 9), 2, 6);
        let eroded = erode(&mask);
        assert!(!eroded[[2, 4, 4]]);
        assert!(eroded[[3, 4, 4]]);
        assert!(eroded[[4, 4, 4]]);
    }

    #[test]
    fn test_dilate_grows_faces() {
        let mask = cube_mask((9, 9, 9), 3, 5);
        let dilated = dilate(&mask, 3);
        assert!(dilated[[2, 4, 4]]);
        assert!(!dilated[[0, 4, 4]]);
    }

    #[test]
    fn test_fill_in_closes_single_gap() {
        let mut mask = Array3::from_elem((1, 1, 5), false);
        mask[[0, 0, 1]] = true;
        mask[[0, 0, 3]] = true;
        let filled = fill_in_once(&mask);
        assert!(filled[[0, 0, 2]]);
        assert!(!filled[[0, 0, 0]]);
    }

    #[test]
    fn test_auto_bbox() {
        let mut data = Array3::zeros((10, 10, 10));
        data[[2, 3, 4]] = 1.0;
        data[[7, 5, 6]] = 2.0;
        let bbox = auto_bbox(&data).unwrap();
        assert_eq!(bbox.lo, [4, 3, 2]);
        assert_eq!(bbox.hi, [6, 5, 7]);
        assert_eq!(bbox.extent(0), 3);
        assert!(auto_bbox(&Array3::zeros((2, 2, 2))).is_none());
    }

    #[test]
    fn test_bbox_grown_clamped() {
        let bbox = BoundingBox { lo: [2, 2, 2], hi: [5, 5, 5] };
        let grown = bbox.grown_clamped(4, 1, [10, 10, 10]);
        assert_eq!(grown.lo, [1, 1, 1]);
        assert_eq!(grown.hi, [8, 8, 8]);
    }
}

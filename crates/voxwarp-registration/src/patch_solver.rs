//! Baseline patch solver: coarse-to-fine translation estimation.
//!
//! Each level tiles the grid with overlapping cubic patches, finds the
//! integer patch displacement minimizing a weight-biased score, blends the
//! patch displacements into a dense increment, and composes the increment
//! with the running warp. The level grid halves until the minimum patch
//! size. This keeps the pipeline executable and testable end-to-end; it is
//! not the production optimizer.

use rayon::prelude::*;
use tracing::{debug, info};

use voxwarp_core::filter::{downsample_by_two, fwhm_to_sigma, median_filter, GaussianFilter};
use voxwarp_core::interpolation::InterpKind;
use voxwarp_core::mask::BoundingBox;
use voxwarp_core::transform::WarpField;
use voxwarp_core::volume::Volume;

use crate::config::{MatchMethod, SolveStrategy};
use crate::error::{PipelineError, Result};
use crate::solver::{SolveOutcome, SolveRequest, SolvedPair, WarpSolver};

/// Default smallest patch edge, in voxels.
const DEFAULT_MIN_PATCH: usize = 13;
/// Patches whose weight mass falls below this fraction of their volume
/// contribute nothing.
const PATCH_WEIGHT_FLOOR: f64 = 1e-6;
/// Relative strength of the displacement-magnitude penalty.
const PENALTY_SCALE: f64 = 1e-3;

/// In-tree baseline warp solver.
pub struct PatchSolver {
    min_patch: usize,
}

impl Default for PatchSolver {
    fn default() -> Self {
        Self {
            min_patch: DEFAULT_MIN_PATCH,
        }
    }
}

impl PatchSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_patch(mut self, min_patch: usize) -> Self {
        self.min_patch = min_patch.max(5);
        self
    }

    /// Patch edge per refinement level: full extent halving down to the
    /// minimum patch size.
    fn level_sizes(&self, dims: [usize; 3], min_patch: usize) -> Vec<usize> {
        let mut size = dims.iter().copied().max().unwrap_or(min_patch);
        let mut sizes = vec![size];
        while size / 2 >= min_patch {
            size /= 2;
            sizes.push(size);
        }
        sizes
    }

    fn blur_volume(volume: &Volume, radius: f64) -> Volume {
        if radius >= 0.5 {
            GaussianFilter::isotropic(fwhm_to_sigma(radius)).apply(volume)
        } else if radius <= -1.0 {
            median_filter(volume, -radius, None)
        } else {
            volume.clone()
        }
    }

    fn solve_standard(
        &self,
        base: &Volume,
        weight: &Volume,
        source: &Volume,
        request: &SolveRequest<'_>,
        min_patch: usize,
        level_range: (usize, Option<usize>),
        initial: Option<&WarpField>,
    ) -> Result<WarpField> {
        let dims = base.dims();
        let sizes = self.level_sizes(dims, min_patch);
        let max_level = level_range.1.unwrap_or(sizes.len() - 1).min(sizes.len() - 1);
        let init_level = level_range.0.min(max_level);

        let mut warp = match initial {
            Some(w) => w.clone(),
            None => WarpField::zeros(dims),
        };

        for (level, &size) in sizes.iter().enumerate() {
            if level < init_level || level > max_level {
                continue;
            }
            let warped = warp.apply_to(source, request.interp);
            let mut increment =
                estimate_level(base, weight, &warped, size, request)?;
            for (axis, &locked) in request.axis_locks.iter().enumerate() {
                if locked {
                    increment.lock_axis(axis);
                }
            }
            let moved = increment.max_magnitude();
            debug!(level, size, moved, "level increment");
            warp = WarpField::compose(&increment, &warp);
        }

        for (axis, &locked) in request.axis_locks.iter().enumerate() {
            if locked {
                warp.lock_axis(axis);
            }
        }
        Ok(warp)
    }
}

impl WarpSolver for PatchSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> Result<SolveOutcome> {
        let min_patch = request.min_patch.unwrap_or(self.min_patch).max(5);
        let source_blurred = Self::blur_volume(request.source, request.source_blur);

        match request.strategy {
            SolveStrategy::Standard => {
                info!("patch solve: standard strategy");
                let warp = self.solve_standard(
                    request.base,
                    request.weight,
                    &source_blurred,
                    request,
                    min_patch,
                    (request.init_level, request.max_level),
                    request.initial_warp,
                )?;
                let image = warp.apply_to(request.source, request.interp);
                Ok(SolveOutcome::Single(SolvedPair { image, warp }))
            }
            SolveStrategy::Duplo => {
                info!("patch solve: half-resolution first");
                let coarse_base = downsample_by_two(request.base);
                let coarse_weight = downsample_by_two(request.weight);
                let coarse_source = downsample_by_two(&source_blurred);
                let coarse_min = (min_patch / 2).max(5);
                let coarse = self.solve_standard(
                    &coarse_base,
                    &coarse_weight,
                    &coarse_source,
                    request,
                    coarse_min,
                    (0, None),
                    None,
                )?;
                let upsampled = coarse.upsample_doubled(request.base.dims());

                // Refine at full resolution, skipping the coarsest level.
                let warp = self.solve_standard(
                    request.base,
                    request.weight,
                    &source_blurred,
                    request,
                    min_patch,
                    (1, None),
                    Some(&upsampled),
                )?;
                let image = warp.apply_to(request.source, request.interp);
                Ok(SolveOutcome::Single(SolvedPair { image, warp }))
            }
            SolveStrategy::PlusMinus => {
                info!("patch solve: symmetric strategy");
                // Base-side blur happens here in symmetric mode, so both
                // sides are treated alike.
                let base_blurred = Self::blur_volume(request.base, request.base_blur);
                let full = self.solve_standard(
                    &base_blurred,
                    request.weight,
                    &source_blurred,
                    request,
                    min_patch,
                    (request.init_level, request.max_level),
                    request.initial_warp,
                )?;

                // Each side moves half the net displacement to the midpoint.
                let plus_warp = full.clone().scaled(0.5);
                let minus_warp = full.scaled(-0.5);
                let plus_image = plus_warp.apply_to(request.source, request.interp);
                let minus_image = minus_warp.apply_to(request.base, request.interp);
                Ok(SolveOutcome::Symmetric {
                    plus: SolvedPair {
                        image: plus_image,
                        warp: plus_warp,
                    },
                    minus: SolvedPair {
                        image: minus_image,
                        warp: minus_warp,
                    },
                })
            }
        }
    }
}

/// One candidate patch: origin and edge lengths per axis, clamped to the
/// grid.
#[derive(Debug, Clone, Copy)]
struct Patch {
    lo: [usize; 3],
    len: [usize; 3],
}

impl Patch {
    fn bbox(&self) -> BoundingBox {
        BoundingBox {
            lo: self.lo,
            hi: [
                self.lo[0] + self.len[0] - 1,
                self.lo[1] + self.len[1] - 1,
                self.lo[2] + self.len[2] - 1,
            ],
        }
    }
}

fn patch_starts(extent: usize, size: usize) -> Vec<usize> {
    let size = size.min(extent);
    let step = (size / 2).max(1);
    let mut starts = Vec::new();
    let mut s = 0usize;
    loop {
        starts.push(s.min(extent - size));
        if s + size >= extent {
            break;
        }
        s += step;
    }
    starts.dedup();
    starts
}

/// Estimate a dense displacement increment at one level.
fn estimate_level(
    base: &Volume,
    weight: &Volume,
    warped_source: &Volume,
    size: usize,
    request: &SolveRequest<'_>,
) -> Result<WarpField> {
    let dims = base.dims();
    let mut patches = Vec::new();
    for &z in &patch_starts(dims[2], size) {
        for &y in &patch_starts(dims[1], size) {
            for &x in &patch_starts(dims[0], size) {
                patches.push(Patch {
                    lo: [x, y, z],
                    len: [size.min(dims[0]), size.min(dims[1]), size.min(dims[2])],
                });
            }
        }
    }

    let radius = (size / 6).max(2) as isize;
    let matches: Vec<(Patch, [f64; 3])> = patches
        .par_iter()
        .filter_map(|patch| {
            search_patch(base, weight, warped_source, patch, radius, request)
                .map(|delta| (*patch, delta))
        })
        .collect();

    if matches.is_empty() {
        return Err(PipelineError::computation(
            "no patch carried enough weight to match at this level",
        ));
    }

    // Blend constant patch displacements with tent weights, then smooth.
    let mut increment = WarpField::zeros(dims);
    let mut norm = vec![0.0f64; dims[0] * dims[1] * dims[2]];
    let at = |x: usize, y: usize, z: usize| x + dims[0] * (y + dims[1] * z);
    for (patch, delta) in &matches {
        let b = patch.bbox();
        for z in b.lo[2]..=b.hi[2] {
            for y in b.lo[1]..=b.hi[1] {
                for x in b.lo[0]..=b.hi[0] {
                    let w = tent(x, b.lo[0], patch.len[0])
                        * tent(y, b.lo[1], patch.len[1])
                        * tent(z, b.lo[2], patch.len[2]);
                    if w <= 0.0 {
                        continue;
                    }
                    let d = increment.displacement_at(x, y, z);
                    increment.set_displacement(
                        x,
                        y,
                        z,
                        [
                            (d.x + w * delta[0]) as f32,
                            (d.y + w * delta[1]) as f32,
                            (d.z + w * delta[2]) as f32,
                        ],
                    );
                    norm[at(x, y, z)] += w;
                }
            }
        }
    }
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                let n = norm[at(x, y, z)];
                if n > 0.0 {
                    let d = increment.displacement_at(x, y, z);
                    increment.set_displacement(
                        x,
                        y,
                        z,
                        [(d.x / n) as f32, (d.y / n) as f32, (d.z / n) as f32],
                    );
                }
            }
        }
    }

    let sigma = (size as f64 / 8.0).max(1.0);
    let smooth = GaussianFilter::isotropic(sigma);
    for comp in increment.components_mut() {
        smooth.apply_array(comp);
    }
    Ok(increment)
}

/// Tent blending weight of position `u` inside a patch starting at `lo` with
/// edge `len`; positive in the interior.
fn tent(u: usize, lo: usize, len: usize) -> f64 {
    let center = lo as f64 + (len as f64 - 1.0) / 2.0;
    let half = (len as f64 + 1.0) / 2.0;
    (1.0 - (u as f64 - center).abs() / half).max(0.0)
}

/// Find the integer displacement of one patch by axis-separated search.
///
/// Returns `None` when the patch carries (almost) no weight.
fn search_patch(
    base: &Volume,
    weight: &Volume,
    warped_source: &Volume,
    patch: &Patch,
    radius: isize,
    request: &SolveRequest<'_>,
) -> Option<[f64; 3]> {
    let b = patch.bbox();
    let mut wsum = 0.0f64;
    for z in b.lo[2]..=b.hi[2] {
        for y in b.lo[1]..=b.hi[1] {
            for x in b.lo[0]..=b.hi[0] {
                wsum += weight.value_at(x, y, z) as f64;
            }
        }
    }
    let cap = (patch.len[0] * patch.len[1] * patch.len[2]) as f64;
    if wsum <= PATCH_WEIGHT_FLOOR * cap {
        return None;
    }

    let dims = base.dims();
    let mut delta = [0isize; 3];
    for _round in 0..2 {
        for axis in 0..3 {
            if request.axis_locks[axis] || dims[axis] == 1 {
                continue;
            }
            let mut best = score_patch(base, weight, warped_source, patch, delta, request);
            let mut best_c = delta[axis];
            for c in -radius..=radius {
                if c == delta[axis] {
                    continue;
                }
                let mut trial = delta;
                trial[axis] = c;
                let s = score_patch(base, weight, warped_source, patch, trial, request);
                if s < best {
                    best = s;
                    best_c = c;
                }
            }
            delta[axis] = best_c;
        }
    }
    Some([delta[0] as f64, delta[1] as f64, delta[2] as f64])
}

/// Weight-biased matching score of a patch at a trial displacement; lower is
/// better. Out-of-grid samples read as zero, consistent with zero padding.
fn score_patch(
    base: &Volume,
    weight: &Volume,
    warped_source: &Volume,
    patch: &Patch,
    delta: [isize; 3],
    request: &SolveRequest<'_>,
) -> f64 {
    let b = patch.bbox();
    let dims = base.dims();
    let fetch = |x: isize, y: isize, z: isize| -> f64 {
        if x < 0 || y < 0 || z < 0 {
            return 0.0;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= dims[0] || y >= dims[1] || z >= dims[2] {
            return 0.0;
        }
        warped_source.value_at(x, y, z) as f64
    };

    let use_correlation = matches!(
        request.match_method,
        MatchMethod::Pearson
            | MatchMethod::PearsonClipped
            | MatchMethod::LocalPearsonSigned
            | MatchMethod::LocalPearsonAbs
    );

    let mut sw = 0.0f64;
    let mut swb = 0.0f64;
    let mut sws = 0.0f64;
    let mut swbb = 0.0f64;
    let mut swss = 0.0f64;
    let mut swbs = 0.0f64;
    let mut ssd = 0.0f64;
    for z in b.lo[2]..=b.hi[2] {
        for y in b.lo[1]..=b.hi[1] {
            for x in b.lo[0]..=b.hi[0] {
                let w = weight.value_at(x, y, z) as f64;
                if w <= 0.0 {
                    continue;
                }
                let bv = base.value_at(x, y, z) as f64;
                let sv = fetch(
                    x as isize + delta[0],
                    y as isize + delta[1],
                    z as isize + delta[2],
                );
                if use_correlation {
                    sw += w;
                    swb += w * bv;
                    sws += w * sv;
                    swbb += w * bv * bv;
                    swss += w * sv * sv;
                    swbs += w * bv * sv;
                } else {
                    let d = bv - sv;
                    ssd += w * d * d;
                    sw += w;
                    swbb += w * bv * bv;
                }
            }
        }
    }
    if sw <= 0.0 {
        return f64::MAX / 4.0;
    }

    let fit = if use_correlation {
        let var_b = swbb / sw - (swb / sw).powi(2);
        let var_s = swss / sw - (sws / sw).powi(2);
        if var_b <= 1e-12 || var_s <= 1e-12 {
            return f64::MAX / 4.0;
        }
        let cov = swbs / sw - (swb / sw) * (sws / sw);
        let r = (cov / (var_b * var_s).sqrt()).clamp(-1.0, 1.0);
        match request.match_method {
            MatchMethod::LocalPearsonAbs => 1.0 - r.abs(),
            _ => 1.0 - r,
        }
    } else {
        ssd / sw
    };

    // Small bias toward zero displacement, scaled by the patch's intensity
    // mass so it never outweighs a genuine match.
    let d2 = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]) as f64;
    let scale = if use_correlation { 1.0 } else { swbb / sw.max(1e-12) };
    fit + request.penalty_factor * PENALTY_SCALE * d2 / (1.0 + d2.sqrt()) * scale
        / (patch.len[0] as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolveStrategy;
    use voxwarp_core::interpolation::InterpKind;
    use voxwarp_core::spatial::CoordinateFrame;

    fn blob(dims: [usize; 3], center: [f64; 3]) -> Volume {
        Volume::from_fn(dims, CoordinateFrame::identity(), |x, y, z| {
            let dx = x as f64 - center[0];
            let dy = y as f64 - center[1];
            let dz = z as f64 - center[2];
            (1000.0 * (-(dx * dx + dy * dy + dz * dz) / 60.0).exp()) as f32
        })
    }

    fn uniform_weight(dims: [usize; 3]) -> Volume {
        Volume::from_fn(dims, CoordinateFrame::identity(), |_, _, _| 1.0)
    }

    fn request<'a>(
        base: &'a Volume,
        weight: &'a Volume,
        source: &'a Volume,
        strategy: SolveStrategy,
    ) -> SolveRequest<'a> {
        SolveRequest {
            base,
            weight,
            source,
            initial_warp: None,
            interp: InterpKind::Linear,
            match_method: MatchMethod::PearsonClipped,
            axis_locks: [false; 3],
            strategy,
            init_level: 0,
            max_level: None,
            min_patch: Some(16),
            source_blur: 0.0,
            base_blur: 0.0,
            penalty_factor: 1.0,
            penalty_cutoff: 1.0,
        }
    }

    #[test]
    fn test_recovers_integer_shift() {
        let dims = [32, 32, 32];
        let base = blob(dims, [16.0, 16.0, 16.0]);
        // Source content sits 3 voxels lower in x: source(x) = base(x - 3).
        let source = blob(dims, [19.0, 16.0, 16.0]);
        let weight = uniform_weight(dims);

        let req = request(&base, &weight, &source, SolveStrategy::Standard);
        let outcome = PatchSolver::new().solve(&req).unwrap();
        let pair = match outcome {
            SolveOutcome::Single(p) => p,
            _ => panic!("expected a single result"),
        };
        let d = pair.warp.displacement_at(16, 16, 16);
        assert!((d.x - 3.0).abs() <= 0.75, "dx = {}", d.x);
        assert!(d.y.abs() <= 0.75);
        assert!(d.z.abs() <= 0.75);
    }

    #[test]
    fn test_axis_lock_respected() {
        let dims = [32, 32, 32];
        let base = blob(dims, [16.0, 16.0, 16.0]);
        let source = blob(dims, [18.0, 18.0, 16.0]);
        let weight = uniform_weight(dims);

        let mut req = request(&base, &weight, &source, SolveStrategy::Standard);
        req.axis_locks = [true, false, false];
        let outcome = PatchSolver::new().solve(&req).unwrap();
        if let SolveOutcome::Single(pair) = outcome {
            let d = pair.warp.displacement_at(16, 16, 16);
            assert_eq!(d.x, 0.0);
            assert!((d.y - 2.0).abs() <= 0.75);
        } else {
            panic!("expected a single result");
        }
    }

    #[test]
    fn test_plusminus_splits_displacement() {
        let dims = [32, 32, 32];
        let base = blob(dims, [16.0, 16.0, 16.0]);
        let source = blob(dims, [20.0, 16.0, 16.0]);
        let weight = uniform_weight(dims);

        let req = request(&base, &weight, &source, SolveStrategy::PlusMinus);
        let outcome = PatchSolver::new().solve(&req).unwrap();
        match outcome {
            SolveOutcome::Symmetric { plus, minus } => {
                let p = plus.warp.displacement_at(16, 16, 16);
                let m = minus.warp.displacement_at(16, 16, 16);
                // The two halves cancel and sum to the full displacement.
                assert!((p.x + m.x).abs() < 1e-5);
                assert!((p.x - 2.0).abs() <= 0.75, "px = {}", p.x);
            }
            _ => panic!("expected a symmetric result"),
        }
    }

    #[test]
    fn test_identical_volumes_give_near_zero_warp() {
        let dims = [32, 32, 32];
        let base = blob(dims, [16.0, 16.0, 16.0]);
        let source = base.clone();
        let weight = uniform_weight(dims);
        let req = request(&base, &weight, &source, SolveStrategy::Standard);
        let outcome = PatchSolver::new().solve(&req).unwrap();
        if let SolveOutcome::Single(pair) = outcome {
            assert!(pair.warp.max_magnitude() < 0.5);
        } else {
            panic!("expected a single result");
        }
    }

    #[test]
    fn test_duplo_matches_standard_on_shift() {
        let dims = [32, 32, 32];
        let base = blob(dims, [16.0, 16.0, 16.0]);
        let source = blob(dims, [18.0, 16.0, 16.0]);
        let weight = uniform_weight(dims);
        let req = request(&base, &weight, &source, SolveStrategy::Duplo);
        let outcome = PatchSolver::new().solve(&req).unwrap();
        if let SolveOutcome::Single(pair) = outcome {
            let d = pair.warp.displacement_at(16, 16, 16);
            assert!((d.x - 2.0).abs() <= 1.0, "dx = {}", d.x);
        } else {
            panic!("expected a single result");
        }
    }
}

//! Weight volume construction: turn the base image into a normalized
//! importance map biasing the similarity objective.
//!
//! The map fades to zero at the volume faces, keeps only the largest
//! connected cluster of supra-threshold intensity, and is scaled to a
//! maximum of one.

use ndarray::Zip;
use tracing::{debug, info};

use voxwarp_core::filter::{median_filter_array, GaussianFilter};
use voxwarp_core::mask;
use voxwarp_core::volume::Volume;

use crate::config::{PipelineConfig, WeightMode};
use crate::error::{PipelineError, Result};

/// Median radius (voxels) for spike removal before smoothing.
const MEDIAN_RADIUS: f64 = 2.25;
/// Gaussian sigma (voxels) for the general smoothing that follows.
const GAUSS_SIGMA: f64 = 4.50;
/// Margin added around the bounding box in box mode.
const BOX_PAD: usize = 4;

/// Builds a weight map from a base image.
pub struct WeightBuilder {
    mode: WeightMode,
    dilation: usize,
    clip: f64,
    power: f64,
    median_radius: f64,
    gauss_sigma: f64,
}

impl WeightBuilder {
    pub fn new(mode: WeightMode) -> Self {
        Self {
            mode,
            dilation: 5,
            clip: 0.0,
            power: 1.0,
            median_radius: MEDIAN_RADIUS,
            gauss_sigma: GAUSS_SIGMA,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            mode: config.weight_mode,
            dilation: config.weight_dilation,
            clip: config.weight_clip,
            power: config.weight_power,
            median_radius: MEDIAN_RADIUS,
            gauss_sigma: GAUSS_SIGMA,
        }
    }

    /// Rounds of dilation applied after binarizing.
    pub fn with_dilation(mut self, rounds: usize) -> Self {
        self.dilation = rounds;
        self
    }

    /// Hard clip of small positive values before smoothing.
    pub fn with_clip(mut self, clip: f64) -> Self {
        self.clip = clip.max(0.0);
        self
    }

    /// Power-law reshape of nonzero weights.
    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    /// Smoothing radii; zero skips the corresponding filter.
    pub fn with_smoothing(mut self, median_radius: f64, gauss_sigma: f64) -> Self {
        self.median_radius = median_radius;
        self.gauss_sigma = gauss_sigma;
        self
    }

    /// Number of voxels zeroed at each face of an axis of the given extent.
    fn fade_width(extent: usize) -> usize {
        let fade = (0.05 * extent as f64 + 3.0) as usize;
        if 5 * fade >= extent {
            (extent.saturating_sub(1)) / 5
        } else {
            fade
        }
    }

    /// Derive the weight map. Fails with a computation error when the
    /// surviving weight volume is identically zero.
    pub fn build(&self, base: &Volume) -> Result<Volume> {
        info!("weightizing the base image");
        let mut weight = base.clone();
        weight.abs_in_place();

        let [nx, ny, nz] = weight.dims();
        let (xfade, yfade, zfade) = (
            Self::fade_width(nx),
            Self::fade_width(ny),
            Self::fade_width(nz),
        );
        debug!(xfade, yfade, zfade, "face fade widths");
        zero_fade_band(&mut weight, [xfade, yfade, zfade]);

        // Optional hard clip of small positive values.
        if self.clip > 0.0 {
            let clip = self.clip as f32;
            let mut clipped = 0usize;
            for v in weight.data_mut().iter_mut() {
                if *v > 0.0 && *v < clip {
                    *v = 0.0;
                    clipped += 1;
                }
            }
            debug!(clip = self.clip, clipped, "applied user clip");
        }

        // Squash super-large values down to reasonability.
        let top = 3.0 * mask::clip_level(weight.data(), 0.5);
        if top > 0.0 {
            Zip::from(weight.data_mut()).par_for_each(|v| {
                if *v > top {
                    *v = top;
                }
            });
        }

        // Median filter smashes localized spikes, then the Gaussian does a
        // little extra general smoothing.
        let support = mask::positive_mask(weight.data());
        if self.median_radius > 0.0 {
            let filtered = median_filter_array(weight.data(), self.median_radius, Some(&support));
            *weight.data_mut() = filtered;
        }
        if self.gauss_sigma > 0.0 {
            GaussianFilter::isotropic(self.gauss_sigma).apply_array(weight.data_mut());
        }

        // Clip off small values and keep only the largest cluster of
        // supra-threshold voxels, after one erosion pass.
        let threshold = (0.05 * weight.max_value()).max(0.33 * mask::clip_level(weight.data(), 0.33));
        debug!(threshold = threshold as f64, "cluster threshold");
        let thresholded = mask::threshold_mask(weight.data(), threshold);
        let cluster = mask::largest_cluster(&thresholded);
        let cluster = mask::largest_cluster(&mask::erode(&cluster));
        Zip::from(weight.data_mut())
            .and(&cluster)
            .par_for_each(|v, &keep| {
                if !keep {
                    *v = 0.0;
                }
            });

        // Smoothing bleeds intensity back into the faded faces; the band
        // stays zero in the graded map.
        zero_fade_band(&mut weight, [xfade, yfade, zfade]);

        // Normalize to a max of one.
        let max = weight.max_value();
        if max <= 0.0 {
            return Err(PipelineError::computation(
                "cannot compute weight: max value seen as 0",
            ));
        }
        let scale = 1.0 / max;
        Zip::from(weight.data_mut()).par_for_each(|v| {
            *v = if *v <= 0.0 { 0.0 } else { *v * scale };
        });

        if self.power > 0.0 && self.power != 1.0 {
            let power = self.power as f32;
            Zip::from(weight.data_mut()).par_for_each(|v| {
                if *v > 0.0 {
                    *v = v.powf(power);
                }
            });
        }

        if matches!(self.mode, WeightMode::Binary | WeightMode::BinaryBox) {
            self.binarize(&mut weight);
        }

        Ok(weight)
    }

    fn binarize(&self, weight: &mut Volume) {
        Zip::from(weight.data_mut()).par_for_each(|v| {
            *v = if *v != 0.0 { 1.0 } else { 0.0 };
        });

        if self.dilation > 0 {
            let mut m = mask::positive_mask(weight.data());
            for _ in 0..self.dilation {
                m = mask::fill_in_once(&mask::dilate(&m, 3));
            }
            Zip::from(weight.data_mut()).and(&m).par_for_each(|v, &on| {
                *v = if on { 1.0 } else { 0.0 };
            });
        }

        if self.mode == WeightMode::BinaryBox {
            if let Some(bbox) = mask::auto_bbox(weight.data()) {
                let dims = weight.dims();
                let boxed = bbox.grown_clamped(BOX_PAD, 1, dims);
                debug!(?boxed, "binary box");
                for z in boxed.lo[2]..=boxed.hi[2] {
                    for y in boxed.lo[1]..=boxed.hi[1] {
                        for x in boxed.lo[0]..=boxed.hi[0] {
                            weight.set_value(x, y, z, 1.0);
                        }
                    }
                }
            }
        }
    }
}

/// Zero `widths = (x, y, z)` voxels at both ends of each axis so the volume
/// faces get no weight.
fn zero_fade_band(volume: &mut Volume, widths: [usize; 3]) {
    let [nx, ny, nz] = volume.dims();
    let data = volume.data_mut();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if i < widths[0]
                    || i >= nx - widths[0]
                    || j < widths[1]
                    || j >= ny - widths[1]
                    || k < widths[2]
                    || k >= nz - widths[2]
                {
                    data[[k, j, i]] = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxwarp_core::spatial::CoordinateFrame;

    /// Smooth blob centered in a 48-cube, positive everywhere inside.
    fn blob_base() -> Volume {
        Volume::from_fn([48, 48, 48], CoordinateFrame::identity(), |x, y, z| {
            let dx = x as f64 - 24.0;
            let dy = y as f64 - 24.0;
            let dz = z as f64 - 24.0;
            let r2 = dx * dx + dy * dy + dz * dz;
            (1000.0 * (-r2 / 200.0).exp()) as f32
        })
    }

    fn count_components(volume: &Volume) -> usize {
        let m = mask::positive_mask(volume.data());
        let biggest = mask::largest_cluster(&m);
        let total: usize = m.iter().filter(|&&b| b).count();
        if total == 0 {
            return 0;
        }
        let big: usize = biggest.iter().filter(|&&b| b).count();
        if big == total {
            1
        } else {
            2 // at least two
        }
    }

    #[test]
    fn test_weight_in_unit_range_single_cluster() {
        let weight = WeightBuilder::new(WeightMode::Weighted)
            .build(&blob_base())
            .unwrap();
        assert!(weight.max_value() <= 1.0 + 1e-6);
        assert!(weight.min_value() >= 0.0);
        assert!((weight.max_value() - 1.0).abs() < 1e-5);
        assert_eq!(count_components(&weight), 1);
    }

    #[test]
    fn test_fade_band_zero_on_all_faces() {
        let weight = WeightBuilder::new(WeightMode::Weighted)
            .build(&blob_base())
            .unwrap();
        let fade = WeightBuilder::fade_width(48);
        assert!(fade >= 3);
        let [nx, ny, nz] = weight.dims();
        for a in 0..fade {
            for u in 0..48 {
                for v in 0..48 {
                    assert_eq!(weight.value_at(a, u, v), 0.0);
                    assert_eq!(weight.value_at(nx - 1 - a, u, v), 0.0);
                    assert_eq!(weight.value_at(u, a, v), 0.0);
                    assert_eq!(weight.value_at(u, ny - 1 - a, v), 0.0);
                    assert_eq!(weight.value_at(u, v, a), 0.0);
                    assert_eq!(weight.value_at(u, v, nz - 1 - a), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_binary_mode_is_zero_or_one() {
        let weight = WeightBuilder::new(WeightMode::Binary)
            .build(&blob_base())
            .unwrap();
        for &v in weight.data().iter() {
            assert!(v == 0.0 || v == 1.0);
        }
        assert_eq!(count_components(&weight), 1);
    }

    #[test]
    fn test_box_mode_fills_bounding_box() {
        let weight = WeightBuilder::new(WeightMode::BinaryBox)
            .build(&blob_base())
            .unwrap();
        let bbox = mask::auto_bbox(weight.data()).unwrap();
        // Every voxel inside the box is one.
        for z in bbox.lo[2]..=bbox.hi[2] {
            for y in bbox.lo[1]..=bbox.hi[1] {
                for x in bbox.lo[0]..=bbox.hi[0] {
                    assert_eq!(weight.value_at(x, y, z), 1.0);
                }
            }
        }
    }

    #[test]
    fn test_all_zero_base_is_fatal() {
        let base = Volume::zeros([32, 32, 32], CoordinateFrame::identity());
        let err = WeightBuilder::new(WeightMode::Weighted).build(&base).unwrap_err();
        assert!(matches!(err, PipelineError::Computation(_)));
    }

    #[test]
    fn test_power_reshapes_nonzero() {
        let plain = WeightBuilder::new(WeightMode::Weighted)
            .build(&blob_base())
            .unwrap();
        let squared = WeightBuilder::new(WeightMode::Weighted)
            .with_power(2.0)
            .build(&blob_base())
            .unwrap();
        // Power < 1 weights stay below the originals, max stays 1.
        assert!((squared.max_value() - 1.0).abs() < 1e-5);
        let (x, y, z) = (18, 24, 24);
        let p = plain.value_at(x, y, z);
        if p > 0.0 && p < 1.0 {
            assert!(squared.value_at(x, y, z) < p);
        }
    }
}

//! Padding geometry planning.
//!
//! The warp model has an implicit zero-displacement boundary condition;
//! real content near a face would be truncated by it. The planner reconciles
//! the base content bounding box, any pre-supplied initial warp's grid, and
//! the translation magnitude of a preceding affine step into six margins.

use nalgebra::Vector3;
use tracing::{debug, info};

use voxwarp_core::mask;
use voxwarp_core::spatial::conform_margins;
use voxwarp_core::transform::WarpField;
use voxwarp_core::volume::{PaddingSpec, Volume};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Content threshold: this fraction of the 22%-quantile clip level.
const CONTENT_CLIP_FRAC: f32 = 0.33;
/// Baseline per-axis margin floor, in voxels.
const MARGIN_FLOOR: usize = 9;
/// Per-axis minimum margin as a fraction of the axis extent.
const MARGIN_FRAC: f64 = 0.1111;
/// Safety factor on the affine translation magnitude, in voxels.
const AFFINE_SHIFT_FACTOR: f64 = 1.0111;

/// Outcome of padding planning.
#[derive(Debug, Clone)]
pub struct PaddingPlan {
    pub spec: PaddingSpec,
    /// True when any margin is nonzero and padding will actually happen.
    pub active: bool,
    /// Margins the initial warp grid already provides beyond the base grid.
    pub initial_warp_margins: PaddingSpec,
    /// Base grid dimensions before padding, for the later crop.
    pub original_dims: [usize; 3],
}

/// Plans zero-padding margins for the pipeline.
pub struct PaddingPlanner<'a> {
    config: &'a PipelineConfig,
    affine_translation: Option<Vector3<f64>>,
}

impl<'a> PaddingPlanner<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            affine_translation: None,
        }
    }

    /// Record the world-space translation of a preceding affine step; its
    /// magnitude raises the margin floor.
    pub fn with_affine_translation(mut self, translation: Vector3<f64>) -> Self {
        self.affine_translation = Some(translation);
        self
    }

    /// Compute the padding plan against the base volume and an optional
    /// initial warp.
    pub fn plan(&self, base: &Volume, initial_warp: Option<&WarpField>) -> Result<PaddingPlan> {
        let dims = base.dims();

        // Margins needed to contain the initial warp's grid.
        let iw_margins = match initial_warp {
            Some(warp) => {
                let frame = warp.frame().ok_or_else(|| {
                    PipelineError::input("initial warp has no coordinate frame")
                })?;
                let faces = conform_margins((frame, warp.dims()), (base.frame(), dims))
                    .map_err(|e| {
                        PipelineError::input(format!(
                            "initial warp grid does not fit the base grid: {e}"
                        ))
                    })?;
                PaddingSpec::from_faces(faces)
            }
            None => PaddingSpec::zero(),
        };

        if self.config.no_pad {
            if iw_margins.is_active() {
                return Err(PipelineError::configuration(
                    "initial warp grid is bigger than the base grid and padding is disabled",
                ));
            }
            return Ok(PaddingPlan {
                spec: PaddingSpec::zero(),
                active: false,
                initial_warp_margins: iw_margins,
                original_dims: dims,
            });
        }

        // Bounding box of supra-threshold base content. The same box is
        // reused for the source side so padding stays identical across
        // repeated runs against one base.
        let cv = CONTENT_CLIP_FRAC * mask::clip_level(base.data(), 0.22);
        let content = mask::auto_bbox(&base.data().mapv(|v| if v >= cv { v } else { 0.0 }))
            .unwrap_or(mask::BoundingBox {
                lo: [0, 0, 0],
                hi: [dims[0] - 1, dims[1] - 1, dims[2] - 1],
            });
        debug!(lo = ?content.lo, hi = ?content.hi, "base content box");

        // Margin floor, raised by the affine translation magnitude measured
        // in voxels of the smallest spacing.
        let mut floor = MARGIN_FLOOR;
        if let Some(t) = self.affine_translation {
            let dm = base.frame().min_spacing();
            let shift = (t.x.abs() / dm).max(t.y.abs() / dm).max(t.z.abs() / dm);
            floor += (AFFINE_SHIFT_FACTOR * shift).round() as usize;
            debug!(shift, floor, "affine translation raises margin floor");
        }

        // Per-face margins: the per-axis minimum less the distance from the
        // content box to that face.
        let mut faces = [0usize; 6];
        for axis in 0..3 {
            let n = dims[axis];
            let min_margin = ((MARGIN_FRAC * n as f64).round() as usize).max(floor);
            faces[2 * axis] = min_margin.saturating_sub(content.lo[axis]);
            faces[2 * axis + 1] = min_margin.saturating_sub(n - 1 - content.hi[axis]);
        }
        let mut spec = PaddingSpec::from_faces(faces)
            .max(&iw_margins)
            .with_floor(self.config.pad_floor)
            .with_extra(self.config.pad_extra);

        // No z padding for single-slice volumes.
        if dims[2] == 1 {
            if iw_margins.z_lo > 0 || iw_margins.z_hi > 0 {
                return Err(PipelineError::input(
                    "initial warp required 3-D padding but the base volume is single-slice",
                ));
            }
            spec = spec.without_z();
        }

        let active = spec.is_active();
        if active {
            info!(margins = %spec, "zero-padding planned");
        }
        Ok(PaddingPlan {
            spec,
            active,
            initial_warp_margins: iw_margins,
            original_dims: dims,
        })
    }
}

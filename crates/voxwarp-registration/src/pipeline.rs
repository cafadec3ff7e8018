//! Top-level pipeline controller.
//!
//! A single controlling thread runs the stages strictly in sequence:
//! INIT → [AFFINE_PREREG] → [RESAMPLE_ONLY] → LOAD → [PAD] → WEIGHT →
//! [BLUR] → SOLVE → [UNPAD] → [COMPOSE_AFFINE] →
//! [REWARP_FROM_ORIGINAL_SOURCE] → EXPORT.
//!
//! Each stage consumes its volumes by move and relinquishes ownership to the
//! next; parallelism is confined inside numeric kernels.

use tracing::{info, warn};

use voxwarp_core::filter::{fwhm_to_sigma, median_filter, GaussianFilter};
use voxwarp_core::interpolation::InterpKind;
use voxwarp_core::transform::{AffineMatrix, WarpField};
use voxwarp_core::volume::Volume;

use crate::collaborator::{AffineRegistrar, AffineRequest};
use crate::compose;
use crate::config::{MatchMethod, PipelineConfig, SolveStrategy};
use crate::error::{PipelineError, Result};
use crate::padding::{PaddingPlan, PaddingPlanner};
use crate::provenance::Provenance;
use crate::solver::{SolveOutcome, SolveRequest, WarpSolver};
use crate::weight::WeightBuilder;

/// In-memory pipeline inputs. File loading happens in the front end, after
/// configuration validation.
pub struct PipelineInputs {
    pub base: Volume,
    pub source: Volume,
    pub initial_warp: Option<WarpField>,
    pub user_weight: Option<Volume>,
    pub exclusion_mask: Option<Volume>,
}

/// One image/warp pair of the symmetric result.
#[derive(Debug)]
pub struct SymmetricOutputs {
    pub image: Option<Volume>,
    pub warp: WarpField,
}

/// Everything the pipeline produces for export.
#[derive(Debug)]
pub struct PipelineOutputs {
    pub warped_image: Option<Volume>,
    /// Warp mapping (original) source onto the base grid; carries its
    /// adopted coordinate frame.
    pub forward_warp: WarpField,
    pub inverse_warp: Option<WarpField>,
    /// Present in symmetric mode: the base-side half of the result.
    pub minus: Option<SymmetricOutputs>,
    /// The affine pre-registration matrix, when that step ran.
    pub affine_matrix: Option<AffineMatrix>,
    pub provenance: Provenance,
}

/// Sequences the end-to-end pipeline over a validated configuration.
pub struct PipelineController<'a> {
    config: &'a PipelineConfig,
    solver: &'a dyn WarpSolver,
    registrar: Option<&'a dyn AffineRegistrar>,
}

impl<'a> PipelineController<'a> {
    pub fn new(config: &'a PipelineConfig, solver: &'a dyn WarpSolver) -> Self {
        Self {
            config,
            solver,
            registrar: None,
        }
    }

    /// Attach the affine collaborator; required when the configuration asks
    /// for affine pre-registration or grid resampling.
    pub fn with_registrar(mut self, registrar: &'a dyn AffineRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Run the pipeline to completion.
    pub fn run(&self, inputs: PipelineInputs) -> Result<PipelineOutputs> {
        let config = self.config;
        let provenance = Provenance::from_current_invocation();

        if config.uses_initial_warp != inputs.initial_warp.is_some() {
            return Err(PipelineError::input(
                "configuration and inputs disagree about the initial warp",
            ));
        }

        let PipelineInputs {
            base,
            source,
            initial_warp,
            user_weight,
            exclusion_mask,
        } = inputs;

        // The untouched original source survives for the final re-render.
        let original_source = source.clone();

        // --- AFFINE_PREREG / RESAMPLE_ONLY -------------------------------
        let (source, affine_matrix, collaborator_ran) =
            self.affine_stage(&base, source, exclusion_mask.as_ref())?;

        // --- LOAD checks -------------------------------------------------
        let (mut base, mut source) = self.load_stage(base, source)?;
        let match_method = self.resolve_match_method(&base, &source);

        // --- PAD ---------------------------------------------------------
        let mut planner = PaddingPlanner::new(config);
        if let Some(matrix) = &affine_matrix {
            planner = planner.with_affine_translation(matrix.translation());
        }
        let plan = planner.plan(&base, initial_warp.as_ref())?;

        let mut initial_warp = initial_warp;
        let mut exclusion_mask = exclusion_mask;
        if plan.active {
            info!(margins = %plan.spec, "zero-padding base, source and masks");
            base = base.pad(&plan.spec);
            source = source.pad(&plan.spec);
            exclusion_mask = exclusion_mask.map(|m| m.pad(&plan.spec));
            if let Some(warp) = initial_warp.take() {
                // The warp grid already provides some margins; extend by the
                // remainder so it matches the padded base grid exactly.
                let faces = plan.spec.faces();
                let have = plan.initial_warp_margins.faces();
                let remainder = voxwarp_core::volume::PaddingSpec::from_faces(
                    std::array::from_fn(|i| faces[i] - have[i]),
                );
                initial_warp = Some(warp.extend(&remainder));
            }
        }
        if let Some(warp) = &initial_warp {
            if warp.dims() != base.dims() {
                return Err(PipelineError::input(format!(
                    "initial warp grid {:?} does not match the working grid {:?}",
                    warp.dims(),
                    base.dims()
                )));
            }
        }

        // --- WEIGHT ------------------------------------------------------
        let weight = self.weight_stage(&base, user_weight, &plan, exclusion_mask.as_ref())?;

        // --- BLUR (base side; the solver blurs the source) ---------------
        let solve_base = if config.plusminus {
            // Symmetric mode blurs both sides inside the solver.
            base.clone()
        } else {
            blur_stage(&base, config.blur_base)
        };

        // --- SOLVE -------------------------------------------------------
        let strategy = self.resolve_strategy(&base);
        info!(?strategy, "starting warp optimization");
        let outcome = {
            let request = SolveRequest {
                base: &solve_base,
                weight: &weight,
                source: &source,
                initial_warp: initial_warp.as_ref(),
                interp: InterpKind::Linear,
                match_method,
                axis_locks: config.axis_locks(),
                strategy,
                init_level: config.init_level,
                max_level: config.max_level,
                min_patch: config.min_patch,
                source_blur: config.blur_source,
                base_blur: config.blur_base,
                penalty_factor: config.penalty_factor,
                penalty_cutoff: config.penalty_cutoff,
            };
            self.solver.solve(&request)?
        };
        // The weighted and blurred working copies are no longer needed.
        drop(weight);
        drop(solve_base);

        let (solved, minus_pair) = match outcome {
            SolveOutcome::Single(pair) => (pair, None),
            SolveOutcome::Symmetric { plus, minus } => (plus, Some(minus)),
        };

        // --- UNPAD / frame adoption --------------------------------------
        let padded_frame = *base.frame();
        let (mut image, mut warp) = (solved.image, solved.warp.adopt_frame(padded_frame));
        if plan.active {
            info!("un-padding output back to the original base grid");
            image = image.crop(&plan.spec);
            if !config.keep_padded_warp {
                warp = warp.crop(&plan.spec);
            }
        }
        let minus = minus_pair.map(|pair| {
            let mut m_image = pair.image;
            let mut m_warp = pair.warp.adopt_frame(padded_frame);
            if plan.active {
                m_image = m_image.crop(&plan.spec);
                if !config.keep_padded_warp {
                    m_warp = m_warp.crop(&plan.spec);
                }
            }
            SymmetricOutputs {
                image: config.write_image.then_some(m_image),
                warp: m_warp,
            }
        });

        // --- COMPOSE_AFFINE ----------------------------------------------
        if let Some(matrix) = &affine_matrix {
            info!("composing the affine matrix as the leading transform");
            let frame = *warp
                .frame()
                .unwrap_or(&padded_frame);
            warp = compose::compose_affine_then_warp(matrix, &warp, &frame);
        }

        // --- REWARP_FROM_ORIGINAL_SOURCE ---------------------------------
        // When a collaborator replaced the source, re-rendering from the
        // untouched original avoids double interpolation blur.
        let mut warped_image = if config.write_image {
            if collaborator_ran {
                info!("re-rendering the output from the untouched original source");
                let render_warp = if plan.active && config.keep_padded_warp {
                    warp.crop(&plan.spec)
                } else {
                    warp.clone()
                };
                Some(render_warp.resample_source(&original_source, InterpKind::Linear))
            } else {
                Some(image)
            }
        } else {
            None
        };
        if let Some(img) = &mut warped_image {
            if config.negative_clamp {
                img.clamp_negatives();
            }
        }

        // --- inverse warp -------------------------------------------------
        let inverse_warp = if config.write_inverse_warp && !config.plusminus {
            info!("inverting the forward warp");
            Some(compose::invert(&warp)?)
        } else {
            None
        };

        info!("pipeline complete");
        Ok(PipelineOutputs {
            warped_image,
            forward_warp: warp,
            inverse_warp,
            minus,
            affine_matrix,
            provenance,
        })
    }

    /// Run the collaborator when configured. Returns the (possibly replaced)
    /// source, the affine matrix when registration ran, and whether the
    /// collaborator was actually invoked.
    fn affine_stage(
        &self,
        base: &Volume,
        source: Volume,
        exclusion_mask: Option<&Volume>,
    ) -> Result<(Volume, Option<AffineMatrix>, bool)> {
        let config = self.config;

        if config.affine.is_on() {
            let registrar = self.registrar.ok_or_else(|| {
                PipelineError::configuration(
                    "affine pre-registration requested but no collaborator is attached",
                )
            })?;
            info!("running external affine pre-registration");
            let request = AffineRequest {
                base,
                source: &source,
                exclusion_mask,
                extra_options: config.affine_opts.as_deref(),
                fast: matches!(config.affine, crate::config::AffineMode::Fast),
                negative_clamp: config.negative_clamp,
                verbosity: config.verbosity,
            };
            let outcome = registrar.register(&request)?;
            let matrix = outcome.matrix.ok_or_else(|| {
                PipelineError::collaborator("affine registration produced no matrix")
            })?;
            info!("replacing the in-memory source with the affine result");
            return Ok((outcome.resampled_source, Some(matrix), true));
        }

        if config.resample_only {
            if base.same_grid_as(&source) {
                warn!("resampling is not needed (same grid), turning it off");
                return Ok((source, None, false));
            }
            let registrar = self.registrar.ok_or_else(|| {
                PipelineError::configuration(
                    "grid resampling requested but no collaborator is attached",
                )
            })?;
            info!("resampling the source onto the base grid");
            let request = AffineRequest {
                base,
                source: &source,
                exclusion_mask: None,
                extra_options: None,
                fast: false,
                negative_clamp: config.negative_clamp,
                verbosity: config.verbosity,
            };
            let outcome = registrar.resample(&request)?;
            return Ok((outcome.resampled_source, None, true));
        }

        Ok((source, None, false))
    }

    fn load_stage(&self, mut base: Volume, mut source: Volume) -> Result<(Volume, Volume)> {
        if !base.same_grid_as(&source) {
            return Err(PipelineError::input(
                "base and source grids do not match; resampling is required",
            ));
        }
        if base.identical_to(&source) {
            return Err(PipelineError::input("base and source volumes are identical"));
        }
        if self.config.negative_clamp {
            let nb = base.clamp_negatives();
            let ns = source.clamp_negatives();
            if nb + ns > 0 {
                info!(base = nb, source = ns, "negative voxels clamped to zero");
            }
        }
        Ok((base, source))
    }

    /// Clipped correlation assumes non-negative data; fall back to the plain
    /// variant when negatives survive.
    fn resolve_match_method(&self, base: &Volume, source: &Volume) -> MatchMethod {
        let method = self.config.match_method;
        if method == MatchMethod::PearsonClipped
            && (base.min_value() < 0.0 || source.min_value() < 0.0)
        {
            warn!("negative values present, using strict correlation");
            return MatchMethod::Pearson;
        }
        method
    }

    /// Half-resolution solving needs room to refine; small grids drop back
    /// to the standard strategy.
    fn resolve_strategy(&self, base: &Volume) -> SolveStrategy {
        let strategy = self.config.solve_strategy();
        if strategy == SolveStrategy::Duplo {
            let min_patch = self.config.min_patch.unwrap_or(13);
            if base.dims().iter().any(|&n| n < 3 * min_patch) {
                warn!(dims = ?base.dims(), "grid too small for half-resolution solving, using the standard strategy");
                return SolveStrategy::Standard;
            }
        }
        strategy
    }

    fn weight_stage(
        &self,
        base: &Volume,
        user_weight: Option<Volume>,
        plan: &PaddingPlan,
        exclusion_mask: Option<&Volume>,
    ) -> Result<Volume> {
        let mut weight = match user_weight {
            Some(w) => {
                let w = if plan.active { w.pad(&plan.spec) } else { w };
                if w.dims() != base.dims() {
                    return Err(PipelineError::input(format!(
                        "weight volume grid {:?} does not match the base grid {:?}",
                        w.dims(),
                        base.dims()
                    )));
                }
                w
            }
            None => WeightBuilder::from_config(self.config).build(base)?,
        };

        // Scale so the max is one and nothing is negative.
        let max = weight.max_value();
        if max <= 0.0 {
            return Err(PipelineError::computation("weight volume is not positive"));
        }
        let scale = 1.0 / max;
        for v in weight.data_mut().iter_mut() {
            *v = if *v <= 0.0 { 0.0 } else { *v * scale };
        }

        // Excluded voxels carry no weight in the match.
        if let Some(mask) = exclusion_mask {
            if mask.dims() != weight.dims() {
                return Err(PipelineError::input(
                    "exclusion mask grid does not match the base grid",
                ));
            }
            let mask_data = mask.data();
            for (w, &m) in weight.data_mut().iter_mut().zip(mask_data.iter()) {
                if m != 0.0 {
                    *w = 0.0;
                }
            }
        }
        Ok(weight)
    }
}

/// Base-side blur: positive radii smooth with a Gaussian (FWHM), negative
/// radii select a median filter, small magnitudes do nothing.
fn blur_stage(base: &Volume, radius: f64) -> Volume {
    if radius >= 0.5 {
        info!(radius, "blurring base image");
        GaussianFilter::isotropic(fwhm_to_sigma(radius)).apply(base)
    } else if radius <= -1.0 {
        info!(radius = -radius, "median-filtering base image");
        median_filter(base, -radius, None)
    } else {
        base.clone()
    }
}

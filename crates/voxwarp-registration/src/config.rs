//! Immutable pipeline configuration.
//!
//! Built once from options, validated for mutual exclusions before any
//! volume loads, then passed by reference to every component. Non-fatal
//! redundancies are corrected here with a warning; contradictions are
//! configuration errors.

use serde::Serialize;
use tracing::warn;

use crate::error::{PipelineError, Result};

/// How the importance map is derived from the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WeightMode {
    /// Smoothed, normalized intensity weighting.
    #[default]
    Weighted,
    /// Binarized mask.
    Binary,
    /// Binarized mask replaced by its padded bounding box.
    BinaryBox,
}

/// Similarity metric requested from the warp solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MatchMethod {
    /// Clipped Pearson correlation; falls back to [`Pearson`](Self::Pearson)
    /// when negative values survive in the inputs.
    #[default]
    PearsonClipped,
    Pearson,
    Hellinger,
    MutualInfo,
    NormalizedMutualInfo,
    /// Local Pearson, signed; pairs naturally with a zero max level.
    LocalPearsonSigned,
    LocalPearsonAbs,
}

/// External affine pre-registration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AffineMode {
    #[default]
    Off,
    /// Full affine registration.
    Full,
    /// One-pass, loosely converged affine registration.
    Fast,
}

impl AffineMode {
    pub fn is_on(&self) -> bool {
        !matches!(self, AffineMode::Off)
    }
}

/// Solve strategy, resolved once at pipeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveStrategy {
    Standard,
    /// Half-resolution first.
    Duplo,
    /// Symmetric: base and source each move half the net warp.
    PlusMinus,
}

/// Immutable pipeline configuration. Treat as read-only after
/// [`build`](PipelineConfigBuilder::build).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub prefix: String,
    pub verbosity: u8,
    pub match_method: MatchMethod,
    /// Base-side blur radius (FWHM, voxels); negative selects a median
    /// filter of that radius.
    pub blur_base: f64,
    /// Source-side blur radius, handed to the solver.
    pub blur_source: f64,
    pub weight_mode: WeightMode,
    pub weight_power: f64,
    pub weight_dilation: usize,
    pub weight_clip: f64,
    /// Scale on the solver's displacement penalty; zero disables it.
    pub penalty_factor: f64,
    pub penalty_cutoff: f64,
    /// Smallest patch edge the solver may refine to; `None` = solver default.
    pub min_patch: Option<usize>,
    pub init_level: usize,
    pub max_level: Option<usize>,
    pub no_pad: bool,
    /// Keep the solved warp on the padded grid instead of cropping it back.
    pub keep_padded_warp: bool,
    pub pad_floor: usize,
    pub pad_extra: usize,
    pub lock_x: bool,
    pub lock_y: bool,
    pub lock_z: bool,
    pub duplo: bool,
    pub plusminus: bool,
    pub plus_name: String,
    pub minus_name: String,
    pub affine: AffineMode,
    pub affine_opts: Option<String>,
    pub keep_affine_outputs: bool,
    pub resample_only: bool,
    /// Zero negative base/source voxels at load.
    pub negative_clamp: bool,
    /// An explicit initial warp will be supplied as the solver's start.
    pub uses_initial_warp: bool,
    pub write_image: bool,
    pub write_warp: bool,
    pub write_inverse_warp: bool,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// The solve strategy implied by the mode toggles.
    pub fn solve_strategy(&self) -> SolveStrategy {
        if self.plusminus {
            SolveStrategy::PlusMinus
        } else if self.duplo {
            SolveStrategy::Duplo
        } else {
            SolveStrategy::Standard
        }
    }

    /// Axis locks as `(x, y, z)` flags.
    pub fn axis_locks(&self) -> [bool; 3] {
        [self.lock_x, self.lock_y, self.lock_z]
    }
}

/// Builder for [`PipelineConfig`]; `build` validates mutual exclusions and
/// applies non-fatal corrections.
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            config: PipelineConfig {
                prefix: "voxwarp".to_string(),
                verbosity: 1,
                match_method: MatchMethod::default(),
                blur_base: 2.345,
                blur_source: 2.345,
                weight_mode: WeightMode::default(),
                weight_power: 1.0,
                weight_dilation: 5,
                weight_clip: 0.0,
                penalty_factor: 1.0,
                penalty_cutoff: 1.0,
                min_patch: None,
                init_level: 0,
                max_level: None,
                no_pad: false,
                keep_padded_warp: false,
                pad_floor: 0,
                pad_extra: 0,
                lock_x: false,
                lock_y: false,
                lock_z: false,
                duplo: false,
                plusminus: false,
                plus_name: "PLUS".to_string(),
                minus_name: "MINUS".to_string(),
                affine: AffineMode::Off,
                affine_opts: None,
                keep_affine_outputs: true,
                resample_only: false,
                negative_clamp: false,
                uses_initial_warp: false,
                write_image: true,
                write_warp: true,
                write_inverse_warp: false,
            },
        }
    }
}

impl PipelineConfigBuilder {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.config.verbosity = verbosity;
        self
    }

    pub fn match_method(mut self, method: MatchMethod) -> Self {
        self.config.match_method = method;
        self
    }

    /// Blur radii (base, source); negative values select a median filter.
    pub fn blur(mut self, base: f64, source: f64) -> Self {
        self.config.blur_base = base;
        self.config.blur_source = source;
        self
    }

    pub fn weight_mode(mut self, mode: WeightMode) -> Self {
        self.config.weight_mode = mode;
        self
    }

    pub fn weight_power(mut self, power: f64) -> Self {
        self.config.weight_power = power;
        self
    }

    pub fn weight_dilation(mut self, rounds: usize) -> Self {
        self.config.weight_dilation = rounds;
        self
    }

    pub fn weight_clip(mut self, clip: f64) -> Self {
        self.config.weight_clip = clip.max(0.0);
        self
    }

    pub fn penalty(mut self, factor: f64, cutoff: f64) -> Self {
        self.config.penalty_factor = factor.max(0.0);
        self.config.penalty_cutoff = cutoff.clamp(0.0, 1.0);
        self
    }

    pub fn min_patch(mut self, size: usize) -> Self {
        self.config.min_patch = Some(size);
        self
    }

    pub fn init_level(mut self, level: usize) -> Self {
        self.config.init_level = level;
        self
    }

    pub fn max_level(mut self, level: usize) -> Self {
        self.config.max_level = Some(level);
        self
    }

    pub fn no_pad(mut self, on: bool) -> Self {
        self.config.no_pad = on;
        self
    }

    pub fn keep_padded_warp(mut self, on: bool) -> Self {
        self.config.keep_padded_warp = on;
        self
    }

    pub fn pad_floor(mut self, floor: usize) -> Self {
        self.config.pad_floor = floor;
        self
    }

    pub fn pad_extra(mut self, extra: usize) -> Self {
        self.config.pad_extra = extra;
        self
    }

    pub fn lock_axes(mut self, x: bool, y: bool, z: bool) -> Self {
        self.config.lock_x = x;
        self.config.lock_y = y;
        self.config.lock_z = z;
        self
    }

    pub fn duplo(mut self, on: bool) -> Self {
        self.config.duplo = on;
        self
    }

    pub fn plusminus(mut self, on: bool) -> Self {
        self.config.plusminus = on;
        self
    }

    pub fn plusminus_names(mut self, plus: impl Into<String>, minus: impl Into<String>) -> Self {
        self.config.plus_name = plus.into();
        self.config.minus_name = minus.into();
        self
    }

    pub fn affine(mut self, mode: AffineMode) -> Self {
        self.config.affine = mode;
        self
    }

    pub fn affine_opts(mut self, opts: impl Into<String>) -> Self {
        self.config.affine_opts = Some(opts.into());
        self
    }

    pub fn keep_affine_outputs(mut self, on: bool) -> Self {
        self.config.keep_affine_outputs = on;
        self
    }

    pub fn resample_only(mut self, on: bool) -> Self {
        self.config.resample_only = on;
        self
    }

    pub fn negative_clamp(mut self, on: bool) -> Self {
        self.config.negative_clamp = on;
        self
    }

    pub fn initial_warp(mut self, on: bool) -> Self {
        self.config.uses_initial_warp = on;
        self
    }

    pub fn write_image(mut self, on: bool) -> Self {
        self.config.write_image = on;
        self
    }

    pub fn write_warp(mut self, on: bool) -> Self {
        self.config.write_warp = on;
        self
    }

    pub fn write_inverse_warp(mut self, on: bool) -> Self {
        self.config.write_inverse_warp = on;
        self
    }

    /// Validate mutual exclusions and apply non-fatal corrections.
    ///
    /// Runs before any volume is loaded; a violation leaves no partial work
    /// behind.
    pub fn build(self) -> Result<PipelineConfig> {
        let mut cfg = self.config;

        if cfg.lock_x && cfg.lock_y && cfg.lock_z {
            return Err(PipelineError::configuration(
                "all three axis locks are set, nothing left to warp",
            ));
        }
        if cfg.affine.is_on() && cfg.plusminus {
            return Err(PipelineError::configuration(
                "affine pre-registration cannot be combined with plusminus",
            ));
        }
        if cfg.affine.is_on() && cfg.uses_initial_warp {
            return Err(PipelineError::configuration(
                "affine pre-registration cannot be combined with an initial warp",
            ));
        }
        if cfg.affine.is_on() && cfg.init_level > 0 {
            return Err(PipelineError::configuration(
                "affine pre-registration cannot be combined with a nonzero initial level",
            ));
        }
        if cfg.uses_initial_warp && cfg.duplo {
            return Err(PipelineError::configuration(
                "an initial warp cannot be combined with duplo",
            ));
        }
        if cfg.duplo && (cfg.init_level > 0 || cfg.max_level.is_some()) {
            return Err(PipelineError::configuration(
                "explicit level bounds cannot be combined with duplo",
            ));
        }
        if let (Some(max), init) = (cfg.max_level, cfg.init_level) {
            if max < init {
                return Err(PipelineError::configuration(format!(
                    "max level {max} is below initial level {init}"
                )));
            }
        }

        // Non-fatal redundancies: correct the configuration and proceed.
        if cfg.plusminus && cfg.duplo {
            warn!("plusminus does not work with duplo, turning duplo off");
            cfg.duplo = false;
        }
        if cfg.affine.is_on() && cfg.resample_only {
            warn!("affine pre-registration turns off resample-only");
            cfg.resample_only = false;
        }
        if cfg.affine_opts.is_some() && !cfg.affine.is_on() {
            warn!("affine collaborator options are ignored without the affine step");
            cfg.affine_opts = None;
        }
        if cfg.no_pad && (cfg.pad_floor > 0 || cfg.pad_extra > 0) {
            warn!("an explicit padding floor/extra re-enables padding");
            cfg.no_pad = false;
        }
        if cfg.match_method == MatchMethod::LocalPearsonSigned {
            match cfg.max_level {
                None => {
                    cfg.max_level = Some(0);
                }
                Some(m) if m > 0 => {
                    warn!("a max level of 0 is recommended with the signed local Pearson metric");
                }
                _ => {}
            }
        }

        Ok(cfg)
    }
}

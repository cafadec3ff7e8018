//! voxwarp command line front end.
//!
//! Parses options into an immutable pipeline configuration (validated before
//! anything is loaded), sizes the worker pool once, loads the input volumes,
//! runs the pipeline and writes the persisted outputs.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info};

use voxwarp_registration::{
    AffineMode, MatchMethod, PatchSolver, PipelineConfig, PipelineController, PipelineInputs,
    PipelineOutputs, SubprocessRegistrar, WeightMode,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatchMethodArg {
    /// Clipped Pearson correlation (default).
    Pcl,
    /// Pearson correlation.
    Pear,
    /// Hellinger distance.
    Hel,
    /// Mutual information.
    Mi,
    /// Normalized mutual information.
    Nmi,
    /// Local Pearson, signed.
    Lpc,
    /// Local Pearson, absolute value.
    Lpa,
}

impl From<MatchMethodArg> for MatchMethod {
    fn from(arg: MatchMethodArg) -> Self {
        match arg {
            MatchMethodArg::Pcl => MatchMethod::PearsonClipped,
            MatchMethodArg::Pear => MatchMethod::Pearson,
            MatchMethodArg::Hel => MatchMethod::Hellinger,
            MatchMethodArg::Mi => MatchMethod::MutualInfo,
            MatchMethodArg::Nmi => MatchMethod::NormalizedMutualInfo,
            MatchMethodArg::Lpc => MatchMethod::LocalPearsonSigned,
            MatchMethodArg::Lpa => MatchMethod::LocalPearsonAbs,
        }
    }
}

/// Nonlinear warp registration of a source volume onto a base volume.
#[derive(Parser, Debug)]
#[command(name = "voxwarp", version, about)]
struct Cli {
    /// Base (template) volume.
    #[arg(long)]
    base: PathBuf,

    /// Source volume to be warped onto the base.
    #[arg(long)]
    source: PathBuf,

    /// Prefix for all output files.
    #[arg(long, default_value = "voxwarp")]
    prefix: String,

    /// Increase verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Suppress progress messages.
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Similarity metric handed to the solver.
    #[arg(long, value_enum, default_value = "pcl")]
    method: MatchMethodArg,

    /// Blur radii (base [source], FWHM voxels); negative = median filter.
    #[arg(long, num_args = 1..=2, allow_negative_numbers = true)]
    blur: Option<Vec<f64>>,

    /// User-supplied weight volume (skips the automatic weight).
    #[arg(long)]
    weight: Option<PathBuf>,

    /// Binary weight mask instead of graded weighting.
    #[arg(long)]
    noweight: bool,

    /// Replace the binary weight with its padded bounding box.
    #[arg(long, requires = "noweight")]
    weight_box: bool,

    /// Raise the weight to this power.
    #[arg(long, default_value_t = 1.0)]
    weight_power: f64,

    /// Dilation rounds for the binarized weight.
    #[arg(long, default_value_t = 5)]
    weight_dilation: usize,

    /// Zero positive weight values below this level.
    #[arg(long, default_value_t = 0.0)]
    weight_clip: f64,

    /// Scale on the solver's displacement penalty; 0 disables it.
    #[arg(long, default_value_t = 1.0)]
    penalty_factor: f64,

    /// Penalty cutoff, as a fraction of the level schedule.
    #[arg(long, default_value_t = 1.0)]
    penalty_cutoff: f64,

    /// Smallest patch edge the solver may refine to.
    #[arg(long)]
    min_patch: Option<usize>,

    /// First refinement level (re-entry with a prior warp).
    #[arg(long, default_value_t = 0)]
    init_level: usize,

    /// Last refinement level.
    #[arg(long)]
    max_level: Option<usize>,

    /// Disable zero-padding.
    #[arg(long)]
    no_pad: bool,

    /// Keep the solved warp on the padded grid instead of cropping it.
    #[arg(long)]
    keep_padded_warp: bool,

    /// Minimum padding per face, in voxels.
    #[arg(long, default_value_t = 0)]
    pad_floor: usize,

    /// Extra padding added to every face, in voxels.
    #[arg(long, default_value_t = 0)]
    pad_extra: usize,

    /// Forbid displacement along x.
    #[arg(long)]
    lock_x: bool,

    /// Forbid displacement along y.
    #[arg(long)]
    lock_y: bool,

    /// Forbid displacement along z.
    #[arg(long)]
    lock_z: bool,

    /// Solve at half resolution first.
    #[arg(long)]
    duplo: bool,

    /// Symmetric solve: base and source each move half the net warp.
    #[arg(long)]
    plusminus: bool,

    /// Output name tags for the symmetric results.
    #[arg(long, num_args = 2, value_names = ["PLUS", "MINUS"])]
    pm_names: Option<Vec<String>>,

    /// Run external affine registration first.
    #[arg(long, conflicts_with = "resample")]
    affine: bool,

    /// One-pass, loosely converged affine registration.
    #[arg(long, requires = "affine")]
    affine_fast: bool,

    /// Extra options passed through to the affine tool.
    #[arg(long)]
    affine_opts: Option<String>,

    /// Keep the affine tool's output files.
    #[arg(long)]
    keep_affine: bool,

    /// External affine-registration executable.
    #[arg(long, default_value = "3dAllineate")]
    affine_tool: PathBuf,

    /// Resample the source onto the base grid without registering.
    #[arg(long)]
    resample: bool,

    /// Zero negative input voxels at load.
    #[arg(long)]
    negative_clamp: bool,

    /// Initial warp to start from (re-entry).
    #[arg(long)]
    init_warp: Option<PathBuf>,

    /// Mask of voxels excluded from matching.
    #[arg(long)]
    exclude_mask: Option<PathBuf>,

    /// Do not write the warped image.
    #[arg(long)]
    no_image: bool,

    /// Do not write the forward warp.
    #[arg(long)]
    no_warp: bool,

    /// Also write the inverse warp.
    #[arg(long, conflicts_with = "plusminus")]
    inverse_warp: bool,

    /// Worker threads for the numeric kernels (default: all cores).
    #[arg(long)]
    threads: Option<usize>,
}

impl Cli {
    fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            1 + self.verbose
        }
    }

    fn to_config(&self) -> voxwarp_registration::Result<PipelineConfig> {
        let mut builder = PipelineConfig::builder()
            .prefix(&self.prefix)
            .verbosity(self.verbosity())
            .match_method(self.method.into())
            .weight_power(self.weight_power)
            .weight_dilation(self.weight_dilation)
            .weight_clip(self.weight_clip)
            .penalty(self.penalty_factor, self.penalty_cutoff)
            .init_level(self.init_level)
            .no_pad(self.no_pad)
            .keep_padded_warp(self.keep_padded_warp)
            .pad_floor(self.pad_floor)
            .pad_extra(self.pad_extra)
            .lock_axes(self.lock_x, self.lock_y, self.lock_z)
            .duplo(self.duplo)
            .plusminus(self.plusminus)
            .resample_only(self.resample)
            .negative_clamp(self.negative_clamp)
            .initial_warp(self.init_warp.is_some())
            .keep_affine_outputs(self.keep_affine)
            .write_image(!self.no_image)
            .write_warp(!self.no_warp)
            .write_inverse_warp(self.inverse_warp);

        if let Some(blur) = &self.blur {
            let base = blur[0];
            let source = *blur.get(1).unwrap_or(&blur[0]);
            builder = builder.blur(base, source);
        }
        if self.noweight {
            builder = builder.weight_mode(if self.weight_box {
                WeightMode::BinaryBox
            } else {
                WeightMode::Binary
            });
        }
        if let Some(size) = self.min_patch {
            builder = builder.min_patch(size);
        }
        if let Some(level) = self.max_level {
            builder = builder.max_level(level);
        }
        if self.affine {
            builder = builder.affine(if self.affine_fast {
                AffineMode::Fast
            } else {
                AffineMode::Full
            });
        }
        if let Some(opts) = &self.affine_opts {
            builder = builder.affine_opts(opts);
        }
        if let Some(names) = &self.pm_names {
            builder = builder.plusminus_names(&names[0], &names[1]);
        }
        builder.build()
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    // Validate the configuration before touching any file.
    let config = cli.to_config()?;

    // One-time worker pool sizing; individual kernels share this pool.
    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to size the worker pool")?;
    }
    info!(threads = rayon::current_num_threads(), "worker pool ready");

    let base = voxwarp_io::read_volume(&cli.base)
        .with_context(|| format!("cannot load base volume {}", cli.base.display()))?;
    let source = voxwarp_io::read_volume(&cli.source)
        .with_context(|| format!("cannot load source volume {}", cli.source.display()))?;
    let initial_warp = cli
        .init_warp
        .as_ref()
        .map(voxwarp_io::read_warp)
        .transpose()
        .context("cannot load initial warp")?;
    let user_weight = cli
        .weight
        .as_ref()
        .map(voxwarp_io::read_volume)
        .transpose()
        .context("cannot load weight volume")?;
    let exclusion_mask = cli
        .exclude_mask
        .as_ref()
        .map(voxwarp_io::read_volume)
        .transpose()
        .context("cannot load exclusion mask")?;

    let solver = PatchSolver::new();
    let registrar = SubprocessRegistrar::new(&cli.affine_tool)
        .with_keep_outputs(cli.keep_affine);
    let controller = PipelineController::new(&config, &solver).with_registrar(&registrar);

    let outputs = controller.run(PipelineInputs {
        base,
        source,
        initial_warp,
        user_weight,
        exclusion_mask,
    })?;

    write_outputs(&config, outputs)
}

fn write_outputs(config: &PipelineConfig, outputs: PipelineOutputs) -> Result<()> {
    let prefix = &config.prefix;
    let run_id = &outputs.provenance.run_id;
    let image_name = |tag: &str| {
        if tag.is_empty() {
            format!("{prefix}.nii")
        } else {
            format!("{prefix}_{tag}.nii")
        }
    };

    let plus_tag = if config.plusminus {
        config.plus_name.clone()
    } else {
        String::new()
    };

    if let Some(image) = &outputs.warped_image {
        let path = image_name(&plus_tag);
        voxwarp_io::write_volume_tagged(&path, image, run_id)?;
        info!(path = %path, "wrote warped image");
    }
    if config.write_warp {
        let tag = if config.plusminus {
            format!("{}_WARP", config.plus_name)
        } else {
            "WARP".to_string()
        };
        let path = image_name(&tag);
        voxwarp_io::write_warp_tagged(&path, &outputs.forward_warp, run_id)?;
        info!(path = %path, "wrote forward warp");
    }
    if let Some(inverse) = &outputs.inverse_warp {
        let path = image_name("WARPINV");
        voxwarp_io::write_warp_tagged(&path, inverse, run_id)?;
        info!(path = %path, "wrote inverse warp");
    }
    if let Some(minus) = &outputs.minus {
        if let Some(image) = &minus.image {
            let path = image_name(&config.minus_name);
            voxwarp_io::write_volume_tagged(&path, image, run_id)?;
            info!(path = %path, "wrote minus image");
        }
        if config.write_warp {
            let path = image_name(&format!("{}_WARP", config.minus_name));
            voxwarp_io::write_warp_tagged(&path, &minus.warp, run_id)?;
            info!(path = %path, "wrote minus warp");
        }
    }

    // Invocation provenance rides along as a JSON sidecar.
    let sidecar = format!("{prefix}_provenance.json");
    let json = serde_json::to_string_pretty(&outputs.provenance)?;
    std::fs::write(&sidecar, json)
        .with_context(|| format!("cannot write provenance sidecar {sidecar}"))?;
    info!(path = %sidecar, "wrote provenance");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbosity());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

//! External affine registration collaborator.
//!
//! The pipeline never builds shell strings; the collaborator is a typed
//! interface with an explicit success/failure result, so tests can stub it
//! and the production implementation drives the external tool as a
//! subprocess with an argv list.

use std::path::PathBuf;
use std::process::Command;

use tracing::info;

use voxwarp_core::transform::AffineMatrix;
use voxwarp_core::volume::Volume;

use crate::error::{PipelineError, Result};
use crate::provenance::new_run_id;

/// Inputs handed to the collaborator.
pub struct AffineRequest<'a> {
    pub base: &'a Volume,
    pub source: &'a Volume,
    pub exclusion_mask: Option<&'a Volume>,
    pub extra_options: Option<&'a str>,
    /// One-pass, loosely converged registration.
    pub fast: bool,
    /// Ask the tool to clip negative output values.
    pub negative_clamp: bool,
    pub verbosity: u8,
}

/// Successful collaborator result.
#[derive(Debug)]
pub struct AffineOutcome {
    /// Source resampled onto the base grid.
    pub resampled_source: Volume,
    /// World-space transform; present for registration, absent for
    /// resampling.
    pub matrix: Option<AffineMatrix>,
}

/// Affine pre-registration / resampling collaborator.
pub trait AffineRegistrar {
    /// Affinely register source to base; yields the resampled source and the
    /// 4×4 matrix.
    fn register(&self, request: &AffineRequest<'_>) -> Result<AffineOutcome>;

    /// Resample source onto the base grid without registering.
    fn resample(&self, request: &AffineRequest<'_>) -> Result<AffineOutcome>;
}

/// Production registrar: synchronously runs an external affine-registration
/// executable. The call blocks to completion with no timeout; a nonzero exit
/// status or a missing/corrupt artifact is fatal and never retried.
pub struct SubprocessRegistrar {
    program: PathBuf,
    work_dir: PathBuf,
    keep_outputs: bool,
}

impl SubprocessRegistrar {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_dir: std::env::temp_dir(),
            keep_outputs: false,
        }
    }

    /// Directory for intermediate volumes and tool outputs.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Keep the tool's output files instead of deleting them.
    pub fn with_keep_outputs(mut self, keep: bool) -> Self {
        self.keep_outputs = keep;
        self
    }

    fn run(&self, request: &AffineRequest<'_>, registration: bool) -> Result<AffineOutcome> {
        let run_id = new_run_id();
        let base_path = self.work_dir.join(format!("{run_id}_base.nii"));
        let source_path = self.work_dir.join(format!("{run_id}_source.nii"));
        let out_path = self.work_dir.join(format!("{run_id}_resampled.nii"));
        let matrix_path = self.work_dir.join(format!("{run_id}_matrix.1D"));
        let emask_path = self.work_dir.join(format!("{run_id}_emask.nii"));

        voxwarp_io::write_volume(&base_path, request.base)
            .map_err(|e| PipelineError::collaborator(format!("cannot stage base volume: {e}")))?;
        voxwarp_io::write_volume(&source_path, request.source)
            .map_err(|e| PipelineError::collaborator(format!("cannot stage source volume: {e}")))?;

        let mut cmd = Command::new(&self.program);
        if registration {
            cmd.arg("-base").arg(&base_path);
            cmd.arg("-source").arg(&source_path);
            cmd.arg("-prefix").arg(&out_path);
            cmd.arg("-1Dmatrix_save").arg(&matrix_path);
            cmd.args(["-cmass", "-final", "wsinc5", "-float", "-master", "BASE"]);
            if let Some(mask) = request.exclusion_mask {
                voxwarp_io::write_volume(&emask_path, mask).map_err(|e| {
                    PipelineError::collaborator(format!("cannot stage exclusion mask: {e}"))
                })?;
                cmd.arg("-emask").arg(&emask_path);
            }
            if request.negative_clamp {
                cmd.arg("-zclip");
            }
            if request.fast {
                cmd.args(["-norefinal", "-onepass", "-conv", "1.0"]);
            }
            let extra = request.extra_options.unwrap_or("");
            for opt in extra.split_whitespace() {
                cmd.arg(opt);
            }
            if !extra.contains("-fineblur") {
                cmd.args(["-fineblur", "4.44"]);
            }
        } else {
            cmd.arg("-master").arg(&base_path);
            cmd.arg("-source").arg(&source_path);
            cmd.arg("-prefix").arg(&out_path);
            cmd.args(["-final", "wsinc5", "-float", "-1Dparam_apply", "1D: 12@0"]);
        }
        match request.verbosity {
            0 => {
                cmd.arg("-quiet");
            }
            2.. => {
                cmd.arg("-verb");
            }
            _ => {}
        }

        info!(program = %self.program.display(), run_id = %run_id, "starting affine collaborator");
        let status = match cmd.status() {
            Ok(status) => status,
            Err(e) => {
                self.cleanup(&[&base_path, &source_path, &out_path, &matrix_path, &emask_path]);
                return Err(PipelineError::collaborator(format!(
                    "failed to launch {}: {e}",
                    self.program.display()
                )));
            }
        };
        if !status.success() {
            self.cleanup(&[&base_path, &source_path, &out_path, &matrix_path, &emask_path]);
            return Err(PipelineError::collaborator(format!(
                "affine registration command failed with status {status}"
            )));
        }

        let resampled_source = voxwarp_io::read_volume(&out_path).map_err(|e| {
            PipelineError::collaborator(format!("cannot read affine output volume: {e}"))
        })?;
        let matrix = if registration {
            let m = voxwarp_io::read_affine_matrix(&matrix_path).map_err(|e| {
                PipelineError::collaborator(format!("cannot read affine matrix file: {e}"))
            })?;
            Some(m)
        } else {
            None
        };

        if !self.keep_outputs {
            self.cleanup(&[&base_path, &source_path, &out_path, &matrix_path, &emask_path]);
        }
        Ok(AffineOutcome {
            resampled_source,
            matrix,
        })
    }

    fn cleanup(&self, paths: &[&PathBuf]) {
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl AffineRegistrar for SubprocessRegistrar {
    fn register(&self, request: &AffineRequest<'_>) -> Result<AffineOutcome> {
        self.run(request, true)
    }

    fn resample(&self, request: &AffineRequest<'_>) -> Result<AffineOutcome> {
        self.run(request, false)
    }
}

//! Warp solver interface.
//!
//! The controller hands the solver pre-processed (weighted, blurred, padded)
//! volumes and configuration; it never implements optimization itself. The
//! production-grade polynomial-basis optimizer is an external collaborator;
//! [`crate::patch_solver::PatchSolver`] is the in-tree baseline.

use voxwarp_core::interpolation::InterpKind;
use voxwarp_core::transform::WarpField;
use voxwarp_core::volume::Volume;

use crate::config::{MatchMethod, SolveStrategy};
use crate::error::Result;

/// Everything a solver needs for one solve.
pub struct SolveRequest<'a> {
    pub base: &'a Volume,
    pub weight: &'a Volume,
    pub source: &'a Volume,
    /// Starting field for re-entry; grids must already agree with the base.
    pub initial_warp: Option<&'a WarpField>,
    pub interp: InterpKind,
    pub match_method: MatchMethod,
    /// Locked displacement axes `(x, y, z)`.
    pub axis_locks: [bool; 3],
    pub strategy: SolveStrategy,
    pub init_level: usize,
    pub max_level: Option<usize>,
    /// Smallest patch edge to refine to; `None` = solver default.
    pub min_patch: Option<usize>,
    /// Source-side blur (FWHM, voxels); negative selects a median filter.
    pub source_blur: f64,
    /// Base-side blur, applied by the solver only in symmetric mode.
    pub base_blur: f64,
    pub penalty_factor: f64,
    pub penalty_cutoff: f64,
}

/// One warped image with the warp that produced it.
pub struct SolvedPair {
    pub image: Volume,
    pub warp: WarpField,
}

/// Solver result: one pair, or two for the symmetric strategy.
///
/// In the symmetric case both warps use the same convention as the forward
/// warp: a displacement applied by addition, the plus field to the source
/// and the minus field to the base.
pub enum SolveOutcome {
    Single(SolvedPair),
    Symmetric { plus: SolvedPair, minus: SolvedPair },
}

/// Multi-level patch optimization over a warp field.
pub trait WarpSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> Result<SolveOutcome>;
}

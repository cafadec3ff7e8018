pub mod collaborator;
pub mod compose;
pub mod config;
pub mod error;
pub mod padding;
pub mod patch_solver;
pub mod pipeline;
pub mod provenance;
pub mod solver;
pub mod weight;

pub use collaborator::{AffineOutcome, AffineRegistrar, AffineRequest, SubprocessRegistrar};
pub use config::{AffineMode, MatchMethod, PipelineConfig, SolveStrategy, WeightMode};
pub use error::{PipelineError, Result};
pub use padding::{PaddingPlan, PaddingPlanner};
pub use patch_solver::PatchSolver;
pub use pipeline::{PipelineController, PipelineInputs, PipelineOutputs};
pub use provenance::Provenance;
pub use solver::{SolveOutcome, SolveRequest, SolvedPair, WarpSolver};
pub use weight::WeightBuilder;

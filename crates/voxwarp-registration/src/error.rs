//! Error types for the registration pipeline.
//!
//! Four classes, all fatal at detection: configuration errors surface before
//! any volume loads, input errors at load, collaborator errors on external
//! affine-registration failure, computation errors when a numeric stage
//! produces nothing usable.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Mutually exclusive or missing options; raised before any volume loads.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unreadable inputs, mismatched grids, identical base and source.
    #[error("Input error: {0}")]
    Input(String),

    /// External affine-registration failure; never retried.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// A numeric stage produced nothing usable (empty solver result,
    /// degenerate weight volume).
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    /// Create a collaborator error.
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Create a computation error.
    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation(msg.into())
    }
}

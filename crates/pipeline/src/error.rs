//! Error type shared by every pipeline component.
//!
//! All failures surfaced by this crate are programming or configuration errors:
//! the schedule is a pure function of its inputs, so nothing here is retryable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A tensor does not satisfy the documented shape contract.
    #[error("{context}: expected {expected}, got shape {actual:?}")]
    InvalidShape {
        context: String,
        expected: String,
        actual: Vec<usize>,
    },

    /// Leading dims disagree with the declared `(stages, microbatches)` pair.
    #[error(
        "{context}: expected leading dims matching {expected_stages} stages and \
         {expected_microbatches} microbatches, got shape {actual:?}"
    )]
    LayoutMismatch {
        context: String,
        expected_stages: usize,
        expected_microbatches: usize,
        actual: Vec<usize>,
    },

    /// A stacked parameter leaf does not carry one slice per stage.
    #[error("{context}: leading dim {actual} does not match number of stages {expected}")]
    StageCountMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("expected at least one carry leaf")]
    EmptyCarry,

    /// Two nested containers that must be zipped have different structure.
    #[error("nested structure mismatch: {context}")]
    StructureMismatch { context: String },

    /// Two output collections both define the same leaf.
    #[error("conflicting output for key '{key}'")]
    OutputConflict { key: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl PipelineError {
    pub fn invalid_shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: &[usize],
    ) -> Self {
        Self::InvalidShape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub fn structure(context: impl Into<String>) -> Self {
        Self::StructureMismatch {
            context: context.into(),
        }
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(value: toml::de::Error) -> Self {
        PipelineError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        PipelineError::ConfigFormat(value.to_string())
    }
}

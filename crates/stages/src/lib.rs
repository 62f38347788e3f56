//! Reference stages for the pipeline scheduler.
//!
//! [`DenseResidualStage`] is a small dense residual block with stacked
//! per-stage weights. It implements both the batched and the per-stage stage
//! traits plus parameter specs, and is what the integration tests and
//! benchmarks drive through the pipeline.

pub mod activation;
pub mod dense;
pub mod dropout;

pub use activation::StageActivation;
pub use dense::{DenseResidualStage, DenseStageConfig, ACTIVATION_MEAN};

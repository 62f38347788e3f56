//! GPipe-style pipeline parallelism over a stack of identical stages.
//!
//! `N` stages with stacked parameters `[N, ...]` process `M` microbatches in
//! `M + N - 1` timesteps. Per-stage data moves between two layouts:
//! stage-major `[N, M, ...]` as seen by callers, and pipeline-major
//! `[M + N - 1, N, ...]` where row `t` holds what every stage consumes at
//! timestep `t`. The scheduler runs one batched [`StageComputation`] call per
//! timestep, threads each stage's carry to the next stage one step later, and
//! detaches bubble stages' parameters so only real work contributes gradient.
//!
//! Randomness is explicit: a single [`PrngKey`] is split into one key per
//! (timestep, stage) pair before the loop starts.

pub mod checkpoint;
pub mod checks;
pub mod config;
pub mod error;
pub mod extract;
pub mod layout;
pub mod mask;
pub mod nested;
pub mod outputs;
pub mod params;
pub mod prng;
pub mod scheduler;
pub mod selector;
pub mod sharding;
pub mod stage;
pub mod transition;

pub use checkpoint::{ActivationPolicy, CheckpointTape, TapeGradients};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use layout::PipelineLayout;
pub use nested::{Nested, NestedTensor};
pub use outputs::OutputCollection;
pub use params::{
    initialize_stacked, lift_parameter_specs, ParamInit, ParameterSpec, SpecInitializer,
    StageInitializer,
};
pub use prng::PrngKey;
pub use scheduler::{Pipeline, PipelineGradients, PipelineOutput};
pub use sharding::{MeshAxis, PartitionHints, PartitionSpec, ShardingConstraint, Unconstrained};
pub use stage::{
    StageComputation, StageContext, StageInvocation, StageLayer, StageOutput, Vectorized,
};
pub use transition::{StepRecord, TimestepState, Transition};

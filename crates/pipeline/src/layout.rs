//! Stage-major ⇄ pipeline-major layout transforms.
//!
//! A stage-major tensor `x` has shape `[N, M, ...]`: `x[i, j]` is what stage
//! `i` sees for microbatch `j`. The scheduler walks time, so it wants the
//! pipeline-major layout `[M + N - 1, N, ...]` where row `t` holds what every
//! stage consumes at timestep `t`. Stage `i` handles microbatch `j` at
//! `t = i + j`, which makes the mapping a diagonal:
//!
//! ```text
//! pipeline_major[i + j, i] == stage_major[i, j]
//! ```
//!
//! Both directions are realised with pad/reshape/narrow/transpose only. Pad and
//! narrow are each other's adjoint, so the backward pass of either transform
//! is again a transform rather than a scatter.

use std::sync::Arc;

use candle_core::Tensor;

use crate::checks;
use crate::error::{PipelineError, Result};
use crate::nested::{Nested, NestedTensor};
use crate::sharding::{PartitionSpec, ShardingConstraint, Unconstrained};

/// Declared `(N, M)` geometry plus the placement hook used mid-transform.
#[derive(Clone)]
pub struct PipelineLayout {
    num_stages: usize,
    num_microbatches: usize,
    sharding: Arc<dyn ShardingConstraint>,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("num_stages", &self.num_stages)
            .field("num_microbatches", &self.num_microbatches)
            .finish()
    }
}

impl PipelineLayout {
    pub fn new(num_stages: usize, num_microbatches: usize) -> Self {
        Self {
            num_stages,
            num_microbatches,
            sharding: Arc::new(Unconstrained),
        }
    }

    /// Replaces the placement hook.
    pub fn with_sharding(mut self, sharding: Arc<dyn ShardingConstraint>) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    /// `M + N - 1`.
    pub fn num_timesteps(&self) -> usize {
        self.num_microbatches + self.num_stages - 1
    }

    pub fn sharding(&self) -> &dyn ShardingConstraint {
        self.sharding.as_ref()
    }

    /// `[N, M, ...]` → `[M + N - 1, N, ...]`, zero outside the diagonal band.
    pub fn to_pipeline_major(&self, x: &Tensor, spec: Option<&PartitionSpec>) -> Result<Tensor> {
        let (n, m) = (self.num_stages, self.num_microbatches);
        checks::expect_rank_at_least("to_pipeline_major", x, 2)?;
        checks::expect_leading_pair("to_pipeline_major", x, n, m)?;
        let rest = x.dims()[2..].to_vec();

        // [N, M + N, ...].
        let x = x.pad_with_zeros(1, 0, n)?;
        // [N * (M + N), ...].
        let x = x.reshape(with_rest(&[n * (m + n)], &rest))?;
        // [N * (M + N - 1), ...].
        let x = x.narrow(0, 0, n * (m + n - 1))?;
        // [N, M + N - 1, ...].
        let x = x.reshape(with_rest(&[n, m + n - 1], &rest))?;
        let x = match spec {
            Some(spec) => self.sharding.constrain(x, spec)?,
            None => x,
        };
        // [M + N - 1, N, ...].
        Ok(x.transpose(0, 1)?.contiguous()?)
    }

    /// `[M + N - 1, N, ...]` → `[N, M, ...]`, reading only the diagonal band.
    pub fn from_pipeline_major(&self, x: &Tensor, spec: Option<&PartitionSpec>) -> Result<Tensor> {
        let (n, m) = (self.num_stages, self.num_microbatches);
        let t = self.num_timesteps();
        checks::expect_rank_at_least("from_pipeline_major", x, 2)?;
        match x.dims() {
            [a, b, ..] if *a == t && *b == n => {}
            dims => {
                return Err(PipelineError::LayoutMismatch {
                    context: format!("from_pipeline_major (expects [{t}, {n}, ...])"),
                    expected_stages: n,
                    expected_microbatches: m,
                    actual: dims.to_vec(),
                })
            }
        }
        let rest = x.dims()[2..].to_vec();

        // [N, M + N - 1, ...].
        let x = x.transpose(0, 1)?.contiguous()?;
        // [N * (M + N - 1), ...].
        let x = x.reshape(with_rest(&[n * t], &rest))?;
        // [N * (M + N), ...].
        let x = x.pad_with_zeros(0, 0, n)?;
        // [N, M + N, ...].
        let x = x.reshape(with_rest(&[n, m + n], &rest))?;
        let x = match spec {
            Some(spec) => self.sharding.constrain(x, spec)?,
            None => x,
        };
        // [N, M, ...].
        Ok(x.narrow(1, 0, m)?.contiguous()?)
    }

    /// Leafwise [`PipelineLayout::to_pipeline_major`].
    pub fn nested_to_pipeline_major(
        &self,
        xs: &NestedTensor,
        specs: Option<&Nested<PartitionSpec>>,
    ) -> Result<NestedTensor> {
        match specs {
            Some(specs) => xs.try_zip_map(specs, |x, spec| self.to_pipeline_major(x, Some(spec))),
            None => xs.try_map(|x| self.to_pipeline_major(x, None)),
        }
    }

    /// Leafwise [`PipelineLayout::from_pipeline_major`].
    pub fn nested_from_pipeline_major(
        &self,
        xs: &NestedTensor,
        specs: Option<&Nested<PartitionSpec>>,
    ) -> Result<NestedTensor> {
        match specs {
            Some(specs) => {
                xs.try_zip_map(specs, |x, spec| self.from_pipeline_major(x, Some(spec)))
            }
            None => xs.try_map(|x| self.from_pipeline_major(x, None)),
        }
    }
}

fn with_rest(head: &[usize], rest: &[usize]) -> Vec<usize> {
    let mut dims = Vec::with_capacity(head.len() + rest.len());
    dims.extend_from_slice(head);
    dims.extend_from_slice(rest);
    dims
}

/// Unconstrained `[N, M, ...]` → `[M + N - 1, N, ...]`.
pub fn to_pipeline_major(x: &Tensor, num_stages: usize, num_microbatches: usize) -> Result<Tensor> {
    PipelineLayout::new(num_stages, num_microbatches).to_pipeline_major(x, None)
}

/// Unconstrained `[M + N - 1, N, ...]` → `[N, M, ...]`.
pub fn from_pipeline_major(
    x: &Tensor,
    num_stages: usize,
    num_microbatches: usize,
) -> Result<Tensor> {
    PipelineLayout::new(num_stages, num_microbatches).from_pipeline_major(x, None)
}

/// Splits a global batch `[B, ...]` into `[M, B / M, ...]`.
///
/// Microbatch `j` receives rows `j, j + M, j + 2M, ...`, which keeps any
/// batch partitioning on the per-microbatch axis.
pub fn to_microbatches(x: &Tensor, num_microbatches: usize) -> Result<Tensor> {
    checks::expect_rank_at_least("to_microbatches", x, 1)?;
    let batch = x.dims()[0];
    if num_microbatches == 0 || batch % num_microbatches != 0 {
        return Err(PipelineError::invalid_shape(
            "to_microbatches",
            format!("batch divisible by {num_microbatches} microbatches"),
            x.dims(),
        ));
    }
    let rest = &x.dims()[1..];
    let x = x.reshape(with_rest(&[batch / num_microbatches, num_microbatches], rest))?;
    Ok(x.transpose(0, 1)?.contiguous()?)
}

/// Inverse of [`to_microbatches`]: `[M, B / M, ...]` → `[B, ...]`.
pub fn from_microbatches(x: &Tensor) -> Result<Tensor> {
    checks::expect_rank_at_least("from_microbatches", x, 2)?;
    let (m, per) = (x.dims()[0], x.dims()[1]);
    let rest = x.dims()[2..].to_vec();
    let x = x.transpose(0, 1)?.contiguous()?;
    Ok(x.reshape(with_rest(&[m * per], &rest))?)
}

/// Leafwise [`to_microbatches`].
pub fn nested_to_microbatches(xs: &NestedTensor, num_microbatches: usize) -> Result<NestedTensor> {
    xs.try_map(|x| to_microbatches(x, num_microbatches))
}

/// Leafwise [`from_microbatches`].
pub fn nested_from_microbatches(xs: &NestedTensor) -> Result<NestedTensor> {
    xs.try_map(from_microbatches)
}

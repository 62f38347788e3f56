//! Validity of (stage, timestep) pairs.
//!
//! Stage `i` does real work at timestep `t` iff it is processing microbatch
//! `t - i` and that microbatch exists: `i <= t && t - i < M`. Every other pair
//! is a pipeline bubble. Bubbles still run forward so each timestep stays one
//! uniform batched call; the mask only decides which stages' parameters may
//! receive gradient from that timestep.

use candle_core::{Device, Tensor};

use crate::checks;
use crate::error::Result;
use crate::nested::NestedTensor;

/// True when `stage` processes a real microbatch at timestep `t`.
pub fn is_valid(stage: usize, t: usize, num_microbatches: usize) -> bool {
    stage <= t && t - stage < num_microbatches
}

/// Per-stage validity flags for timestep `t`.
pub fn valid_stages(num_stages: usize, num_microbatches: usize, t: usize) -> Vec<bool> {
    (0..num_stages)
        .map(|stage| is_valid(stage, t, num_microbatches))
        .collect()
}

/// `u8` mask shaped `[N, 1, ..., 1]` (total rank `rank`) for timestep `t`.
pub fn valid_stage_mask(
    num_stages: usize,
    num_microbatches: usize,
    t: usize,
    rank: usize,
    device: &Device,
) -> Result<Tensor> {
    let flags: Vec<u8> = valid_stages(num_stages, num_microbatches, t)
        .into_iter()
        .map(u8::from)
        .collect();
    let mut dims = vec![1usize; rank.max(1)];
    dims[0] = num_stages;
    Ok(Tensor::from_vec(flags, dims, device)?)
}

/// Detaches the parameter slices of bubble stages at timestep `t`.
///
/// Forward values are untouched; gradient reaches a stage's slice only when
/// the stage is valid at `t`. Every leaf must be stacked `[N, ...]`.
pub fn mask_stage_params(
    params: &NestedTensor,
    num_stages: usize,
    num_microbatches: usize,
    t: usize,
) -> Result<NestedTensor> {
    params.try_map_with_path(|path, leaf| {
        checks::expect_stage_dim(&format!("param '{path}'"), leaf, num_stages)?;
        let mask = valid_stage_mask(num_stages, num_microbatches, t, leaf.rank(), leaf.device())?
            .broadcast_as(leaf.shape())?;
        Ok(mask.where_cond(leaf, &leaf.detach())?)
    })
}

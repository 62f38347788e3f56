//! Per-timestep stage inputs.
//!
//! At timestep `t` stage 0 consumes a fresh microbatch while every later stage
//! consumes what its predecessor produced at `t - 1`. Both are expressed as
//! whole-tensor operations on the stage axis: shift the previous carry output
//! down by one (pad a zero row in front, drop the last row) and pick the fresh
//! input for row 0 only.

use candle_core::{Device, Tensor};

use crate::checks;
use crate::error::{PipelineError, Result};
use crate::nested::NestedTensor;

/// `u8` mask `[N, 1, ..., 1]` selecting stage 0.
fn first_stage_mask(num_stages: usize, rank: usize, device: &Device) -> Result<Tensor> {
    let mut flags = vec![0u8; num_stages];
    if let Some(first) = flags.first_mut() {
        *first = 1;
    }
    let mut dims = vec![1usize; rank.max(1)];
    dims[0] = num_stages;
    Ok(Tensor::from_vec(flags, dims, device)?)
}

/// Stage inputs for one leaf.
///
/// `per_stage_inputs` is `[M, N, ...]` with microbatch `j` in slot `[j, 0]`;
/// `carry_output_prev` is `[N, ...]`. When `t >= M` the selected microbatch
/// is a stale one: the value is well defined but only feeds bubble work.
pub fn select_state_or_input(
    per_stage_inputs: &Tensor,
    carry_output_prev: &Tensor,
    t: usize,
    num_microbatches: usize,
) -> Result<Tensor> {
    checks::expect_rank_at_least("carry output of previous timestep", carry_output_prev, 1)?;
    let v_input = per_stage_inputs.get(t % num_microbatches)?;
    if v_input.dims() != carry_output_prev.dims() || v_input.dtype() != carry_output_prev.dtype()
    {
        return Err(PipelineError::invalid_shape(
            "carry output of previous timestep",
            format!("{:?} {:?}", v_input.dims(), v_input.dtype()),
            carry_output_prev.dims(),
        ));
    }
    let n = carry_output_prev.dims()[0];
    let shifted = carry_output_prev.pad_with_zeros(0, 1, 0)?.narrow(0, 0, n)?;
    let is_first = first_stage_mask(n, shifted.rank(), shifted.device())?
        .broadcast_as(shifted.shape())?;
    Ok(is_first.where_cond(&v_input, &shifted)?)
}

/// Leafwise [`select_state_or_input`] over matching trees.
pub fn compute_carry_input(
    per_stage_inputs: &NestedTensor,
    carry_output_prev: &NestedTensor,
    t: usize,
    num_microbatches: usize,
) -> Result<NestedTensor> {
    per_stage_inputs.try_zip_map(carry_output_prev, |input, prev| {
        select_state_or_input(input, prev, t, num_microbatches)
    })
}

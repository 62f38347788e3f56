//! One timestep of the pipeline.

use crate::error::{PipelineError, Result};
use crate::mask;
use crate::nested::NestedTensor;
use crate::outputs::OutputCollection;
use crate::prng::PrngKey;
use crate::selector;
use crate::stage::{StageComputation, StageInvocation};

/// Loop-carried state between timesteps.
#[derive(Debug, Clone)]
pub struct TimestepState {
    pub t: usize,
    /// `[N, ...]` carry produced by every stage at `t - 1`.
    pub carry_output_prev: NestedTensor,
    /// `[M, N, ...]` padded microbatches; slot `[j, 0]` holds microbatch `j`.
    pub per_stage_inputs: NestedTensor,
}

/// What one timestep emits.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// `[N, ...]` carry produced at this timestep.
    pub carry: NestedTensor,
    /// `[N, ...]` per-stage outputs.
    pub y: NestedTensor,
    /// Side outputs of this timestep, stacked `[N, ...]`.
    pub outputs: OutputCollection,
}

/// Everything that stays fixed across timesteps.
pub struct Transition<'a> {
    pub num_stages: usize,
    pub num_microbatches: usize,
    pub params: &'a NestedTensor,
    pub stage: &'a dyn StageComputation,
}

impl Transition<'_> {
    /// Advances `state` by one timestep.
    ///
    /// `keys` holds one key per stage and `xs` is this timestep's `[N, ...]`
    /// slice of the pipeline-major stage inputs.
    pub fn step(
        &self,
        state: TimestepState,
        keys: &[PrngKey],
        xs: &NestedTensor,
    ) -> Result<(TimestepState, StepRecord)> {
        let t = state.t;
        if keys.len() != self.num_stages {
            return Err(PipelineError::StageCountMismatch {
                context: format!("keys for timestep {t}"),
                expected: self.num_stages,
                actual: keys.len(),
            });
        }
        let stage_input = selector::compute_carry_input(
            &state.per_stage_inputs,
            &state.carry_output_prev,
            t,
            self.num_microbatches,
        )?;
        let params = mask::mask_stage_params(self.params, self.num_stages, self.num_microbatches, t)?;
        log::trace!(
            "timestep {t}: valid stages {:?}",
            mask::valid_stages(self.num_stages, self.num_microbatches, t)
        );

        let mut outputs = OutputCollection::new();
        let out = self.stage.apply(
            StageInvocation {
                timestep: t,
                params: &params,
                keys,
                carry: &stage_input,
                xs,
            },
            &mut outputs,
        )?;

        // The carry must keep the shape and dtype it entered with, otherwise
        // the next timestep's selection would mix layouts.
        stage_input.try_zip_map(&out.carry, |before, after| {
            if before.dims() != after.dims() || before.dtype() != after.dtype() {
                return Err(PipelineError::invalid_shape(
                    format!("carry returned at timestep {t}"),
                    format!("{:?} {:?}", before.dims(), before.dtype()),
                    after.dims(),
                ));
            }
            Ok(())
        })?;

        let record = StepRecord {
            carry: out.carry.clone(),
            y: out.y,
            outputs,
        };
        let next = TimestepState {
            t: t + 1,
            carry_output_prev: out.carry,
            per_stage_inputs: state.per_stage_inputs,
        };
        Ok((next, record))
    }
}

//! The GPipe loop.
//!
//! `N` stages process `M` microbatches over `M + N - 1` timesteps. At each
//! timestep every stage runs once (a single batched [`StageComputation`]
//! call); stage `i` works on microbatch `t - i` when that exists and on a
//! bubble otherwise. The loop is strictly sequential in `t`: each step
//! consumes the carry produced by the previous one.

use std::sync::Arc;

use candle_core::Tensor;

use crate::checkpoint::{self, ActivationPolicy, CheckpointTape};
use crate::checks;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extract;
use crate::layout::{self, PipelineLayout};
use crate::nested::NestedTensor;
use crate::outputs::OutputCollection;
use crate::prng::PrngKey;
use crate::sharding::{NestedPartitionSpec, PartitionHints, PartitionSpec, ShardingConstraint};
use crate::stage::StageComputation;
use crate::transition::{StepRecord, TimestepState, Transition};

/// Result of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// `[M, ...]`: the last stage's carry for every microbatch.
    pub carry: NestedTensor,
    /// `[N, M, ...]`: `ys[i, j]` is stage `i`'s output for microbatch `j`.
    pub ys: NestedTensor,
    /// Side outputs under `layer/...` plus `layer{i}/microbatch{j}/...` summaries.
    pub outputs: OutputCollection,
}

impl PipelineOutput {
    /// Copy with every tensor cut out of the autograd graph.
    pub fn detach(&self) -> Result<PipelineOutput> {
        Ok(PipelineOutput {
            carry: self.carry.detach(),
            ys: self.ys.detach(),
            outputs: self.outputs.try_map(|leaf| Ok(leaf.detach()))?,
        })
    }
}

/// Loss value and gradients from [`Pipeline::value_and_grad`].
#[derive(Debug, Clone)]
pub struct PipelineGradients {
    /// Detached scalar returned by the loss function.
    pub loss: Tensor,
    /// Detached forward outputs.
    pub output: PipelineOutput,
    /// Same structure as `params`.
    pub params: NestedTensor,
    /// Same structure as the input carry.
    pub carry: NestedTensor,
    /// Same structure as `xs`, when given.
    pub xs: Option<NestedTensor>,
}

/// Stacked per-timestep records, every leaf `[M + N - 1, N, ...]`.
struct Stacked {
    carry: NestedTensor,
    ys: NestedTensor,
    outputs: OutputCollection,
}

impl Stacked {
    fn from_records(records: Vec<StepRecord>) -> Result<Self> {
        let mut carries = Vec::with_capacity(records.len());
        let mut ys = Vec::with_capacity(records.len());
        let mut collections = Vec::with_capacity(records.len());
        for record in records {
            carries.push(record.carry);
            ys.push(record.y);
            collections.push(record.outputs);
        }
        Ok(Self {
            carry: NestedTensor::stack(&carries, 0)?,
            ys: NestedTensor::stack(&ys, 0)?,
            outputs: OutputCollection::stack(&collections, 0)?,
        })
    }
}

/// Loop inputs derived from the caller's arguments.
struct Prepared {
    carry_specs: NestedPartitionSpec,
    /// `[M, N, ...]`.
    per_stage_inputs: NestedTensor,
    /// Pipeline-major `[M + N - 1, N, ...]`.
    xs: NestedTensor,
    keys: Vec<Vec<PrngKey>>,
    carry_output_prev: NestedTensor,
}

impl Prepared {
    fn initial_state(&self) -> TimestepState {
        TimestepState {
            t: 0,
            carry_output_prev: self.carry_output_prev.clone(),
            per_stage_inputs: self.per_stage_inputs.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    layout: PipelineLayout,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let layout = PipelineLayout::new(config.num_stages, config.num_microbatches);
        Ok(Self { config, layout })
    }

    pub fn with_sharding(mut self, sharding: Arc<dyn ShardingConstraint>) -> Self {
        self.layout = self.layout.with_sharding(sharding);
        self
    }

    /// Overrides the policy selected by the config.
    pub fn with_activation_policy(mut self, policy: ActivationPolicy) -> Self {
        self.config.activation_policy = policy;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn num_stages(&self) -> usize {
        self.config.num_stages
    }

    pub fn num_microbatches(&self) -> usize {
        self.config.num_microbatches
    }

    /// Root key derived from the configured seed.
    pub fn root_key(&self) -> PrngKey {
        PrngKey::new(self.config.seed)
    }

    /// Runs the schedule on microbatched inputs.
    ///
    /// * `params`: every leaf stacked `[N, ...]`.
    /// * `carry`: every leaf `[M, microbatch, ...]`; this is stage 0's input.
    /// * `xs`: optional per-stage inputs, every leaf `[N, M, ...]`.
    ///
    /// The outputs stay attached to whatever autograd graph the inputs carry.
    pub fn run(
        &self,
        stage: &dyn StageComputation,
        params: &NestedTensor,
        key: PrngKey,
        carry: &NestedTensor,
        xs: Option<&NestedTensor>,
        hints: &PartitionHints,
    ) -> Result<PipelineOutput> {
        let prepared = self.prepare(params, key, carry, xs, hints)?;
        let transition = self.transition(stage, params);
        let mut state = prepared.initial_state();
        let mut records: Vec<StepRecord> = Vec::with_capacity(prepared.keys.len());
        for (t, keys_t) in prepared.keys.iter().enumerate() {
            let x_t = prepared.xs.index(t)?;
            let (next, record) = transition.step(state, keys_t, &x_t)?;
            records.push(record);
            state = next;
        }

        self.finish(Stacked::from_records(records)?, &prepared.carry_specs, hints)
    }

    /// Runs the schedule and backpropagates `loss` into `params`, `carry` and
    /// `xs`, keeping activations as the configured [`ActivationPolicy`] says.
    ///
    /// `loss` sees detached side outputs, so gradient flows only through the
    /// final carry and the stage outputs.
    #[allow(clippy::too_many_arguments)]
    pub fn value_and_grad<L>(
        &self,
        stage: &dyn StageComputation,
        params: &NestedTensor,
        key: PrngKey,
        carry: &NestedTensor,
        xs: Option<&NestedTensor>,
        hints: &PartitionHints,
        loss: L,
    ) -> Result<PipelineGradients>
    where
        L: Fn(&PipelineOutput) -> Result<Tensor>,
    {
        let params = checkpoint::track(params)?;
        let carry = checkpoint::track(carry)?;
        let xs = xs.map(checkpoint::track).transpose()?;
        match self.config.activation_policy {
            ActivationPolicy::Save => {
                self.grad_saving(stage, &params, key, &carry, xs.as_ref(), hints, loss)
            }
            ActivationPolicy::Recompute => {
                self.grad_recomputing(stage, &params, key, &carry, xs.as_ref(), hints, loss)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn grad_saving<L>(
        &self,
        stage: &dyn StageComputation,
        params: &NestedTensor,
        key: PrngKey,
        carry: &NestedTensor,
        xs: Option<&NestedTensor>,
        hints: &PartitionHints,
        loss: L,
    ) -> Result<PipelineGradients>
    where
        L: Fn(&PipelineOutput) -> Result<Tensor>,
    {
        let mut output = self.run(stage, params, key, carry, xs, hints)?;
        output.outputs = output.outputs.try_map(|leaf| Ok(leaf.detach()))?;
        let value = loss(&output)?;
        let grads = value.backward()?;
        Ok(PipelineGradients {
            loss: value.detach(),
            output: output.detach()?,
            params: checkpoint::gradients(&grads, params)?,
            carry: checkpoint::gradients(&grads, carry)?,
            xs: xs.map(|xs| checkpoint::gradients(&grads, xs)).transpose()?,
        })
    }

    /// Forward without a graph, loss gradient of the stacked records, then a
    /// reverse sweep over the tape and finally the entry layout transforms.
    #[allow(clippy::too_many_arguments)]
    fn grad_recomputing<L>(
        &self,
        stage: &dyn StageComputation,
        params: &NestedTensor,
        key: PrngKey,
        carry: &NestedTensor,
        xs: Option<&NestedTensor>,
        hints: &PartitionHints,
        loss: L,
    ) -> Result<PipelineGradients>
    where
        L: Fn(&PipelineOutput) -> Result<Tensor>,
    {
        let prepared = self.prepare(params, key, carry, xs, hints)?;
        let frozen_params = params.detach();
        let frozen_xs = prepared.xs.detach();
        let forward = self.transition(stage, &frozen_params);
        let mut tape = CheckpointTape::new(&prepared.per_stage_inputs);
        let mut state = TimestepState {
            t: 0,
            carry_output_prev: prepared.carry_output_prev.clone(),
            per_stage_inputs: tape.per_stage_inputs().clone(),
        };
        let mut records: Vec<StepRecord> = Vec::with_capacity(prepared.keys.len());
        for (t, keys_t) in prepared.keys.iter().enumerate() {
            tape.save(&state)?;
            let (next, record) = forward.step(state, keys_t, &frozen_xs.index(t)?)?;
            records.push(record);
            state = next;
        }
        log::debug!("recompute: kept {} timestep carries", tape.len());

        let stacked = Stacked::from_records(records)?;
        let carry_stack = checkpoint::track(&stacked.carry)?;
        let ys_stack = checkpoint::track(&stacked.ys)?;
        let output = self.finish(
            Stacked {
                carry: carry_stack.clone(),
                ys: ys_stack.clone(),
                outputs: stacked.outputs,
            },
            &prepared.carry_specs,
            hints,
        )?;
        let value = loss(&output)?;
        let grads = value.backward()?;

        let sweep = tape.backward(
            &self.transition(stage, params),
            &prepared.keys,
            &frozen_xs,
            &checkpoint::gradients(&grads, &carry_stack)?,
            &checkpoint::gradients(&grads, &ys_stack)?,
        )?;

        // Chain the sweep's input gradients through the padding and layout
        // transforms applied on entry.
        let entry = checkpoint::sum_scalars(
            [
                checkpoint::weighted_sum(&prepared.per_stage_inputs, &sweep.per_stage_inputs)?,
                checkpoint::weighted_sum(&prepared.xs, &sweep.xs)?,
            ]
            .iter()
            .flatten(),
        )?;
        let (carry_grad, xs_grad) = match entry {
            Some(entry) => {
                let grads = entry.backward()?;
                (
                    checkpoint::gradients(&grads, carry)?,
                    xs.map(|xs| checkpoint::gradients(&grads, xs)).transpose()?,
                )
            }
            None => (
                checkpoint::zeros_like(carry)?,
                xs.map(checkpoint::zeros_like).transpose()?,
            ),
        };

        Ok(PipelineGradients {
            loss: value.detach(),
            output: output.detach()?,
            params: sweep.params,
            carry: carry_grad,
            xs: xs_grad,
        })
    }

    /// Like [`Pipeline::run`] for a full batch `[B, ...]` carry without
    /// per-stage inputs: splits it into `M` microbatches and merges the final
    /// carry back to `[B, ...]`.
    pub fn run_batched(
        &self,
        stage: &dyn StageComputation,
        params: &NestedTensor,
        key: PrngKey,
        inputs: &NestedTensor,
        hints: &PartitionHints,
    ) -> Result<PipelineOutput> {
        let carry = layout::nested_to_microbatches(inputs, self.num_microbatches())?;
        let mut output = self.run(stage, params, key, &carry, None, hints)?;
        output.carry = layout::nested_from_microbatches(&output.carry)?;
        Ok(output)
    }

    fn validate_inputs(
        &self,
        params: &NestedTensor,
        carry: &NestedTensor,
        xs: &NestedTensor,
    ) -> Result<()> {
        let (n, m) = (self.num_stages(), self.num_microbatches());
        if carry.is_empty() {
            return Err(PipelineError::EmptyCarry);
        }
        for (path, leaf) in carry.leaves_with_paths() {
            let context = format!("carry '{path}' (expects [{m}, microbatch, ...])");
            checks::expect_rank_at_least(&context, leaf, 2)?;
            checks::expect_leading_dim(&context, leaf, m)?;
        }
        for (path, leaf) in xs.leaves_with_paths() {
            let context = format!("xs '{path}'");
            checks::expect_leading_pair(&context, leaf, n, m)?;
        }
        for (path, leaf) in params.leaves_with_paths() {
            checks::expect_stage_dim(&format!("param '{path}'"), leaf, n)?;
        }
        Ok(())
    }

    /// `[M, ...]` → `[M, N, ...]` with the microbatch in stage slot 0.
    ///
    /// Slots `1..N` are zero padding, not a broadcast, so only slot 0 gets
    /// gradient.
    fn pad_carry(&self, leaf: &Tensor, spec: &PartitionSpec) -> Result<Tensor> {
        let padded = leaf
            .unsqueeze(1)?
            .pad_with_zeros(1, 0, self.num_stages() - 1)?;
        self.layout.sharding().constrain(padded, spec)
    }

    /// `[N, microbatch, ...]` filled with `bubble_fill`, in the carry dtype.
    fn initial_carry_output(&self, leaf: &Tensor) -> Result<Tensor> {
        let mut dims = leaf.dims().to_vec();
        dims[0] = self.num_stages();
        let zeros = Tensor::zeros(dims, leaf.dtype(), leaf.device())?;
        if self.config.bubble_fill == 0.0 {
            Ok(zeros)
        } else {
            Ok(zeros.affine(1.0, self.config.bubble_fill)?)
        }
    }

    fn transition<'a>(
        &self,
        stage: &'a dyn StageComputation,
        params: &'a NestedTensor,
    ) -> Transition<'a> {
        Transition {
            num_stages: self.num_stages(),
            num_microbatches: self.num_microbatches(),
            params,
            stage,
        }
    }

    /// Validates the inputs and builds everything the loop consumes.
    fn prepare(
        &self,
        params: &NestedTensor,
        key: PrngKey,
        carry: &NestedTensor,
        xs: Option<&NestedTensor>,
        hints: &PartitionHints,
    ) -> Result<Prepared> {
        let (n, m) = (self.num_stages(), self.num_microbatches());
        let empty = NestedTensor::default();
        let xs = xs.unwrap_or(&empty);
        self.validate_inputs(params, carry, xs)?;
        log::debug!(
            "pipeline run: stages={n} microbatches={m} timesteps={} carry={:?} xs={:?} policy={}",
            self.layout.num_timesteps(),
            carry.shapes(),
            xs.shapes(),
            self.config.activation_policy.name()
        );

        let carry_specs = hints.carry_or_default(carry);
        let per_stage_inputs =
            carry.try_zip_map(&carry_specs, |leaf, spec| self.pad_carry(leaf, spec))?;
        let xs_specs = hints.xs_or_default(xs);
        let xs = self.layout.nested_to_pipeline_major(xs, Some(&xs_specs))?;
        Ok(Prepared {
            per_stage_inputs,
            xs,
            keys: key.split_grid(self.layout.num_timesteps(), n),
            carry_output_prev: carry.try_map(|leaf| self.initial_carry_output(leaf))?,
            carry_specs,
        })
    }

    fn finish(
        &self,
        stacked: Stacked,
        carry_specs: &NestedPartitionSpec,
        hints: &PartitionHints,
    ) -> Result<PipelineOutput> {
        let (n, m) = (self.num_stages(), self.num_microbatches());
        let carry = stacked.carry.try_zip_map(carry_specs, |stacked, spec| {
            let last = extract::extract_final_carry(stacked, n, m)?;
            self.layout.sharding().constrain(last, spec)
        })?;
        let ys_specs = hints.ys_or_default(&stacked.ys);
        let ys = self.layout.nested_from_pipeline_major(&stacked.ys, Some(&ys_specs))?;
        let outputs = extract::assemble_outputs(&self.layout, &stacked.outputs)?;
        log::debug!("pipeline done: carry={:?} ys={:?}", carry.shapes(), ys.shapes());

        Ok(PipelineOutput {
            carry,
            ys,
            outputs,
        })
    }
}

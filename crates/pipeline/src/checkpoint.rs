//! Activation checkpointing for the timestep loop.
//!
//! With [`ActivationPolicy::Save`] the autograd graph of every timestep stays
//! alive until the backward pass. With [`ActivationPolicy::Recompute`] the
//! forward loop runs on detached values and a [`CheckpointTape`] keeps only
//! the carry entering each timestep; the reverse sweep rebuilds one timestep
//! at a time from that carry and backpropagates through it before moving on.
//! Both policies produce the same gradients.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::nested::NestedTensor;
use crate::prng::PrngKey;
use crate::transition::{TimestepState, Transition};

/// Config-level choice of policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Keep every intermediate until the backward pass.
    #[default]
    Save,
    /// Keep only per-timestep carries; recompute each timestep during the
    /// reverse sweep.
    Recompute,
}

impl ActivationPolicy {
    pub fn name(self) -> &'static str {
        match self {
            ActivationPolicy::Save => "save",
            ActivationPolicy::Recompute => "recompute",
        }
    }
}

/// Fresh autograd leaves holding the values of `tree`.
pub fn track(tree: &NestedTensor) -> Result<NestedTensor> {
    tree.try_map(|leaf| Ok(Var::from_tensor(&leaf.detach())?.as_tensor().clone()))
}

/// Gradient of every leaf of `tree`, zeros where none reached it.
pub fn gradients(grads: &GradStore, tree: &NestedTensor) -> Result<NestedTensor> {
    tree.try_map(|leaf| match grads.get(leaf) {
        Some(grad) => Ok(grad.clone()),
        None => Ok(leaf.zeros_like()?),
    })
}

pub fn zeros_like(tree: &NestedTensor) -> Result<NestedTensor> {
    tree.try_map(|leaf| Ok(leaf.zeros_like()?))
}

fn add_trees(a: &NestedTensor, b: &NestedTensor) -> Result<NestedTensor> {
    a.try_zip_map(b, |x, y| Ok(x.add(y)?))
}

/// `sum(leaf * cotangent)` over every leaf as an f32 scalar; `None` for a tree
/// without leaves.
///
/// Backpropagating this scalar yields the vector-Jacobian product of `tree`
/// with `cotangent`.
pub fn weighted_sum(tree: &NestedTensor, cotangent: &NestedTensor) -> Result<Option<Tensor>> {
    let terms =
        tree.try_zip_map(cotangent, |x, g| Ok(x.mul(g)?.sum_all()?.to_dtype(DType::F32)?))?;
    sum_scalars(terms.leaves())
}

pub(crate) fn sum_scalars<'a>(terms: impl IntoIterator<Item = &'a Tensor>) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for term in terms {
        total = Some(match total {
            Some(acc) => acc.add(term)?,
            None => term.clone(),
        });
    }
    Ok(total)
}

/// Gradients accumulated by [`CheckpointTape::backward`].
#[derive(Debug, Clone)]
pub struct TapeGradients {
    /// Same structure as the transition's params, `[N, ...]` per leaf.
    pub params: NestedTensor,
    /// `[M, N, ...]`, summed over every timestep.
    pub per_stage_inputs: NestedTensor,
    /// Pipeline-major `[M + N - 1, N, ...]`.
    pub xs: NestedTensor,
}

/// What the recomputing forward pass keeps alive: the padded microbatches
/// (shared by every timestep) and the detached carry entering each timestep.
#[derive(Debug, Clone)]
pub struct CheckpointTape {
    per_stage_inputs: NestedTensor,
    carries: Vec<NestedTensor>,
}

impl CheckpointTape {
    pub fn new(per_stage_inputs: &NestedTensor) -> Self {
        Self {
            per_stage_inputs: per_stage_inputs.detach(),
            carries: Vec::new(),
        }
    }

    pub fn per_stage_inputs(&self) -> &NestedTensor {
        &self.per_stage_inputs
    }

    /// Records the state entering timestep `state.t`; timesteps must be saved
    /// in order.
    pub fn save(&mut self, state: &TimestepState) -> Result<()> {
        if state.t != self.carries.len() {
            return Err(PipelineError::structure(format!(
                "checkpoint for timestep {} saved after {} timesteps",
                state.t,
                self.carries.len()
            )));
        }
        self.carries.push(state.carry_output_prev.detach());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.carries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carries.is_empty()
    }

    /// Reverse sweep over the saved timesteps.
    ///
    /// `carry_cotangent` and `ys_cotangent` are the loss gradients of the
    /// stacked `[M + N - 1, N, ...]` carries and stage outputs. Each timestep
    /// is rerun from its saved carry with the same keys and inputs, so it
    /// reproduces the forward values exactly; the gradient of its incoming
    /// carry is handed to the timestep before it.
    pub fn backward(
        &self,
        transition: &Transition<'_>,
        keys: &[Vec<PrngKey>],
        xs: &NestedTensor,
        carry_cotangent: &NestedTensor,
        ys_cotangent: &NestedTensor,
    ) -> Result<TapeGradients> {
        if keys.len() != self.carries.len() {
            return Err(PipelineError::StageCountMismatch {
                context: "key rows for recomputed timesteps".to_string(),
                expected: self.carries.len(),
                actual: keys.len(),
            });
        }
        let mut params = zeros_like(transition.params)?;
        let mut per_stage_inputs = zeros_like(&self.per_stage_inputs)?;
        let mut xs_grads = Vec::with_capacity(self.carries.len());
        let mut handed_back: Option<NestedTensor> = None;

        for t in (0..self.carries.len()).rev() {
            let carry_in = track(&self.carries[t])?;
            let inputs = track(&self.per_stage_inputs)?;
            let x_t = track(&xs.index(t)?)?;
            let state = TimestepState {
                t,
                carry_output_prev: carry_in.clone(),
                per_stage_inputs: inputs.clone(),
            };
            let (_, record) = transition.step(state, &keys[t], &x_t)?;

            let mut carry_ct = carry_cotangent.index(t)?;
            if let Some(later) = &handed_back {
                carry_ct = add_trees(&carry_ct, later)?;
            }
            let objective = sum_scalars(
                [
                    weighted_sum(&record.carry, &carry_ct)?,
                    weighted_sum(&record.y, &ys_cotangent.index(t)?)?,
                ]
                .iter()
                .flatten(),
            )?;

            let (carry_grad, x_grad) = match objective {
                Some(objective) => {
                    let grads = objective.backward()?;
                    params = add_trees(&params, &gradients(&grads, transition.params)?)?;
                    per_stage_inputs = add_trees(&per_stage_inputs, &gradients(&grads, &inputs)?)?;
                    (gradients(&grads, &carry_in)?, gradients(&grads, &x_t)?)
                }
                None => (zeros_like(&carry_in)?, zeros_like(&x_t)?),
            };
            log::trace!("recomputed timestep {t}");
            handed_back = Some(carry_grad);
            xs_grads.push(x_grad);
        }

        xs_grads.reverse();
        let xs = if xs.is_empty() {
            NestedTensor::default()
        } else {
            NestedTensor::stack(&xs_grads, 0)?
        };
        Ok(TapeGradients {
            params,
            per_stage_inputs,
            xs,
        })
    }
}

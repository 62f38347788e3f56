//! Dense residual stage: `h + dropout(act(h @ w + b))`.
//!
//! Carry leaves are `(microbatch, hidden)` per stage. The stage runs either as
//! a single batched call over all `N` stages ([`StageComputation`]) or one
//! stage at a time through [`pipeline::Vectorized`] ([`StageLayer`]); both give
//! identical results for identical keys.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use pipeline::params::FanAxes;
use pipeline::{
    Nested, NestedTensor, OutputCollection, ParamInit, ParameterSpec, PipelineError, Result,
    SpecInitializer, StageComputation, StageContext, StageInvocation, StageLayer, StageOutput,
};

use crate::activation::StageActivation;
use crate::dropout;

/// Summary emitted by every stage call.
pub const ACTIVATION_MEAN: &str = "activation_mean";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseStageConfig {
    pub hidden: usize,
    #[serde(default)]
    pub activation: StageActivation,
    #[serde(default)]
    pub dropout_p: Option<f32>,
    /// Add the stage input back onto the branch output.
    #[serde(default = "default_residual")]
    pub residual: bool,
}

fn default_residual() -> bool {
    true
}

impl DenseStageConfig {
    pub fn new(hidden: usize) -> Self {
        Self {
            hidden,
            activation: StageActivation::default(),
            dropout_p: None,
            residual: default_residual(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DenseResidualStage {
    config: DenseStageConfig,
    dtype: DType,
    training: bool,
}

impl DenseResidualStage {
    pub fn new(config: DenseStageConfig, dtype: DType) -> Self {
        Self {
            config,
            dtype,
            training: true,
        }
    }

    pub fn config(&self) -> &DenseStageConfig {
        &self.config
    }

    /// Disables dropout when `false`.
    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    /// Per-stage parameter specs: `w` `(hidden, hidden)` and `b` `(hidden)`.
    pub fn param_specs(&self) -> Nested<ParameterSpec> {
        let hidden = self.config.hidden;
        let mut weight = ParameterSpec::new([hidden, hidden], self.dtype, ParamInit::XavierUniform);
        weight.fan_axes = Some(FanAxes::new(vec![0], vec![1]));
        let bias = ParameterSpec::new([hidden], self.dtype, ParamInit::Constant(0.0));
        Nested::map_from([("b", Nested::leaf(bias)), ("w", Nested::leaf(weight))])
    }

    pub fn initializer(&self, device: &Device) -> SpecInitializer {
        SpecInitializer::new(self.param_specs(), device.clone())
    }

    fn dropout_p(&self) -> Option<f32> {
        self.config.dropout_p.filter(|_| self.training)
    }

    fn check_carry(&self, context: &str, h: &Tensor, rank: usize) -> Result<()> {
        if h.rank() != rank || h.dims().last() != Some(&self.config.hidden) {
            return Err(PipelineError::invalid_shape(
                context,
                format!("rank {rank} with trailing dim {}", self.config.hidden),
                h.dims(),
            ));
        }
        Ok(())
    }

    /// Branch output before the residual add; `bias` must broadcast against `h @ w`.
    fn branch(&self, h: &Tensor, w: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let projected = h.matmul(w)?.broadcast_add(bias)?;
        self.config.activation.forward(&projected)
    }

    fn finish(&self, h: &Tensor, branch: Tensor) -> Result<Tensor> {
        if self.config.residual {
            Ok(h.add(&branch)?)
        } else {
            Ok(branch)
        }
    }
}

fn param<'a>(params: &'a NestedTensor, name: &str) -> Result<&'a Tensor> {
    params
        .get(name)
        .and_then(Nested::as_leaf)
        .ok_or_else(|| PipelineError::structure(format!("dense stage expects param '{name}'")))
}

fn carry_leaf(carry: &NestedTensor) -> Result<&Tensor> {
    carry
        .as_leaf()
        .ok_or_else(|| PipelineError::structure("dense stage expects a single carry leaf"))
}

impl StageComputation for DenseResidualStage {
    fn apply(
        &self,
        invocation: StageInvocation<'_>,
        outputs: &mut OutputCollection,
    ) -> Result<StageOutput> {
        let h = carry_leaf(invocation.carry)?;
        self.check_carry("dense stage carry", h, 3)?;
        let w = param(invocation.params, "w")?;
        let b = param(invocation.params, "b")?.unsqueeze(1)?;

        let mut branch = self.branch(h, w, &b)?;
        if let Some(p) = self.dropout_p().filter(|p| *p > 0.0 && *p < 1.0) {
            let mask =
                dropout::stacked_dropout_mask(invocation.keys, &h.dims()[1..], p, h.device())?;
            branch = branch.mul(&mask.to_dtype(branch.dtype())?)?;
        }
        let n = invocation.num_stages();
        outputs.add_summary(
            ACTIVATION_MEAN,
            branch.reshape((n, branch.elem_count() / n))?.to_dtype(DType::F32)?.mean(1)?,
        );
        log::trace!("dense stage t={} batched over {n} stages", invocation.timestep);
        let out = self.finish(h, branch)?;
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    }
}

impl StageLayer for DenseResidualStage {
    fn forward(
        &self,
        ctx: &mut StageContext<'_>,
        carry: &NestedTensor,
        _x: &NestedTensor,
    ) -> Result<StageOutput> {
        let h = carry_leaf(carry)?;
        self.check_carry(&format!("dense stage {} carry", ctx.stage), h, 2)?;
        let w = param(ctx.params, "w")?;
        let b = param(ctx.params, "b")?;

        let branch = self.branch(h, w, b)?;
        let branch = dropout::apply_dropout(&branch, ctx.key, self.dropout_p())?;
        ctx.outputs.add_summary(
            ACTIVATION_MEAN,
            branch.to_dtype(DType::F32)?.mean_all()?,
        );
        let out = self.finish(h, branch)?;
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    }
}

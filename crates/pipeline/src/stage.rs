//! The stage computation consumed by the scheduler.
//!
//! The scheduler calls a [`StageComputation`] once per timestep with every
//! input stacked along a leading stage axis of size `N`. Implementations that
//! can batch over that axis (e.g. a batched matmul over stacked weights) do so
//! directly. [`Vectorized`] covers the rest: it lifts a per-stage
//! [`StageLayer`] by slicing stage `i` out of every input, running the layer,
//! and stacking the results back.

use candle_core::Tensor;

use crate::error::Result;
use crate::nested::{Nested, NestedTensor};
use crate::outputs::OutputCollection;
use crate::prng::PrngKey;

/// Everything a batched stage call sees for one timestep.
///
/// All tensors are stacked `[N, ...]`. `params` already has bubble stages
/// detached for this timestep.
#[derive(Debug, Clone, Copy)]
pub struct StageInvocation<'a> {
    pub timestep: usize,
    pub params: &'a NestedTensor,
    pub keys: &'a [PrngKey],
    pub carry: &'a NestedTensor,
    pub xs: &'a NestedTensor,
}

impl StageInvocation<'_> {
    pub fn num_stages(&self) -> usize {
        self.keys.len()
    }
}

/// Result of a stage call: the carry handed to the next stage and the
/// per-stage output that is collected into `ys`.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub carry: NestedTensor,
    pub y: NestedTensor,
}

impl StageOutput {
    pub fn new(carry: NestedTensor, y: NestedTensor) -> Self {
        Self { carry, y }
    }

    /// Single-leaf carry with no per-stage output.
    pub fn carry_only(carry: Tensor) -> Self {
        Self {
            carry: Nested::leaf(carry),
            y: Nested::default(),
        }
    }
}

/// Batched computation over all `N` stages for one timestep.
pub trait StageComputation: Send + Sync {
    /// Runs every stage. Auxiliary outputs written to `outputs` must be
    /// stacked `[N, ...]` like the returned tensors.
    fn apply(
        &self,
        invocation: StageInvocation<'_>,
        outputs: &mut OutputCollection,
    ) -> Result<StageOutput>;
}

/// Per-stage view handed to a [`StageLayer`].
#[derive(Debug)]
pub struct StageContext<'a> {
    pub stage: usize,
    pub timestep: usize,
    /// This stage's slice of the stacked parameters.
    pub params: &'a NestedTensor,
    pub key: PrngKey,
    /// Fresh scope for this (timestep, stage) call.
    pub outputs: &'a mut OutputCollection,
}

impl StageContext<'_> {
    /// Parameter leaf at `path`, if present.
    pub fn param(&self, path: &str) -> Option<&Tensor> {
        self.params.get_path(path).and_then(Nested::as_leaf)
    }
}

/// One stage's computation on unstacked inputs.
pub trait StageLayer: Send + Sync {
    fn forward(
        &self,
        ctx: &mut StageContext<'_>,
        carry: &NestedTensor,
        x: &NestedTensor,
    ) -> Result<StageOutput>;
}

/// Closure adapter for [`StageLayer`].
pub struct FnLayer<F>(F);

impl<F> StageLayer for FnLayer<F>
where
    F: Fn(&mut StageContext<'_>, &NestedTensor, &NestedTensor) -> Result<StageOutput> + Send + Sync,
{
    fn forward(
        &self,
        ctx: &mut StageContext<'_>,
        carry: &NestedTensor,
        x: &NestedTensor,
    ) -> Result<StageOutput> {
        (self.0)(ctx, carry, x)
    }
}

/// Lifts a per-stage layer to a batched [`StageComputation`].
pub struct Vectorized<L> {
    layer: L,
}

impl<L: StageLayer> Vectorized<L> {
    pub fn new(layer: L) -> Self {
        Self { layer }
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }
}

impl<F> Vectorized<FnLayer<F>>
where
    F: Fn(&mut StageContext<'_>, &NestedTensor, &NestedTensor) -> Result<StageOutput> + Send + Sync,
{
    pub fn from_fn(f: F) -> Self {
        Self::new(FnLayer(f))
    }
}

impl<L: StageLayer> StageComputation for Vectorized<L> {
    fn apply(
        &self,
        invocation: StageInvocation<'_>,
        outputs: &mut OutputCollection,
    ) -> Result<StageOutput> {
        let n = invocation.num_stages();
        let mut carries = Vec::with_capacity(n);
        let mut ys = Vec::with_capacity(n);
        let mut collections = Vec::with_capacity(n);
        for (stage, key) in invocation.keys.iter().copied().enumerate() {
            let params = invocation.params.index(stage)?;
            let carry = invocation.carry.index(stage)?;
            let x = invocation.xs.index(stage)?;
            let mut scoped = OutputCollection::new();
            let mut ctx = StageContext {
                stage,
                timestep: invocation.timestep,
                params: &params,
                key,
                outputs: &mut scoped,
            };
            let out = self.layer.forward(&mut ctx, &carry, &x)?;
            carries.push(out.carry);
            ys.push(out.y);
            collections.push(scoped);
        }
        outputs.merge(OutputCollection::stack(&collections, 0)?)?;
        Ok(StageOutput {
            carry: NestedTensor::stack(&carries, 0)?,
            y: NestedTensor::stack(&ys, 0)?,
        })
    }
}

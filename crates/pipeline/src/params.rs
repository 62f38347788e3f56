//! Stacked per-stage parameters.
//!
//! Every stage owns an identical parameter tree. The pipeline stores them
//! stacked along a new leading axis of size `N`, so a stage's declared
//! [`ParameterSpec`] gains one axis (placed on the `pipeline` mesh axis) and
//! initialisation runs once per stage with its own key.

use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, Uniform};

use crate::checks;
use crate::error::{PipelineError, Result};
use crate::nested::{Nested, NestedTensor};
use crate::prng::PrngKey;
use crate::sharding::{MeshAxis, PartitionSpec, PIPELINE_AXIS};

/// Which axes of a parameter are factorised by optimisers that support it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorizationSpec {
    pub axes: Vec<Option<String>>,
}

/// Axis roles used to derive fan-in / fan-out during initialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanAxes {
    pub in_axes: Vec<usize>,
    pub out_axes: Vec<usize>,
    /// Axes that index independent copies and never count towards fans.
    pub batch_axes: Vec<usize>,
}

impl FanAxes {
    pub fn new(in_axes: Vec<usize>, out_axes: Vec<usize>) -> Self {
        Self {
            in_axes,
            out_axes,
            batch_axes: Vec::new(),
        }
    }

    /// Shifts every axis by one and records the new axis 0 as a batch axis.
    pub fn prepend_batch_axis(&self) -> Self {
        let shift = |axes: &[usize]| axes.iter().map(|axis| axis + 1).collect::<Vec<_>>();
        let mut batch_axes = vec![0];
        batch_axes.extend(shift(&self.batch_axes));
        Self {
            in_axes: shift(&self.in_axes),
            out_axes: shift(&self.out_axes),
            batch_axes,
        }
    }

    /// `(fan_in, fan_out)` for a tensor of `shape`.
    pub fn fans(&self, shape: &[usize]) -> (usize, usize) {
        let product = |axes: &[usize]| {
            axes.iter()
                .filter_map(|axis| shape.get(*axis))
                .product::<usize>()
        };
        (product(&self.in_axes), product(&self.out_axes))
    }
}

/// How a leaf is filled when no prebuilt value exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamInit {
    Constant(f64),
    Uniform { bound: f64 },
    /// Glorot uniform, `bound = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// He uniform, `bound = sqrt(3) * gain / sqrt(fan_in)`.
    KaimingUniform { negative_slope: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub mesh_axes: PartitionSpec,
    pub factorization: Option<FactorizationSpec>,
    pub fan_axes: Option<FanAxes>,
    pub init: ParamInit,
}

impl ParameterSpec {
    /// Unsharded spec with no factorisation and default fans.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType, init: ParamInit) -> Self {
        let shape = shape.into();
        Self {
            mesh_axes: PartitionSpec::unconstrained(shape.len()),
            shape,
            dtype,
            factorization: None,
            fan_axes: None,
            init,
        }
    }

    /// Fans from `fan_axes`, or `(shape[-2], shape[-1])` when unset.
    pub fn fans(&self) -> (usize, usize) {
        if let Some(axes) = &self.fan_axes {
            return axes.fans(&self.shape);
        }
        match self.shape.as_slice() {
            [] => (1, 1),
            [only] => (*only, *only),
            [.., fan_in, fan_out] => (*fan_in, *fan_out),
        }
    }

    /// Draws a fresh value from `key`.
    pub fn sample(&self, key: PrngKey, device: &Device) -> Result<Tensor> {
        let count = self.shape.iter().product::<usize>();
        let bound = match self.init {
            ParamInit::Constant(value) => {
                return Ok(Tensor::full(value as f32, self.shape.as_slice(), device)?
                    .to_dtype(self.dtype)?);
            }
            ParamInit::Uniform { bound } => bound,
            ParamInit::XavierUniform => {
                let (fan_in, fan_out) = self.fans();
                (6.0 / (fan_in + fan_out).max(1) as f64).sqrt()
            }
            ParamInit::KaimingUniform { negative_slope } => {
                let (fan_in, _) = self.fans();
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                3f64.sqrt() * gain / (fan_in.max(1) as f64).sqrt()
            }
        };
        let values: Vec<f32> = if bound > 0.0 {
            let dist = Uniform::new(-bound as f32, bound as f32);
            let mut rng = key.rng();
            (0..count).map(|_| dist.sample(&mut rng)).collect()
        } else {
            vec![0.0; count]
        };
        Ok(Tensor::from_vec(values, self.shape.as_slice(), device)?.to_dtype(self.dtype)?)
    }
}

/// Spec of the stacked parameter as stored by the pipeline.
pub fn lift_parameter_spec(spec: &ParameterSpec, num_stages: usize) -> ParameterSpec {
    let mut shape = Vec::with_capacity(spec.shape.len() + 1);
    shape.push(num_stages);
    shape.extend_from_slice(&spec.shape);
    ParameterSpec {
        shape,
        dtype: spec.dtype,
        mesh_axes: spec.mesh_axes.prepend(MeshAxis::named(PIPELINE_AXIS)),
        factorization: spec.factorization.as_ref().map(|f| {
            let mut axes = vec![None];
            axes.extend(f.axes.iter().cloned());
            FactorizationSpec { axes }
        }),
        fan_axes: spec.fan_axes.as_ref().map(FanAxes::prepend_batch_axis),
        init: spec.init,
    }
}

/// Leafwise [`lift_parameter_spec`].
pub fn lift_parameter_specs(
    specs: &Nested<ParameterSpec>,
    num_stages: usize,
) -> Nested<ParameterSpec> {
    specs.map(|spec| lift_parameter_spec(spec, num_stages))
}

/// Builds one stage's parameter tree.
pub trait StageInitializer: Send + Sync {
    /// `prebuilt` holds already-materialised leaves for this stage; those are
    /// reused as-is instead of being drawn from `key`.
    fn initialize(&self, key: PrngKey, prebuilt: Option<&NestedTensor>) -> Result<NestedTensor>;
}

/// Initialises `num_stages` stages with independent keys and stacks them.
pub fn initialize_stacked(
    init: &dyn StageInitializer,
    key: PrngKey,
    num_stages: usize,
    prebuilt: Option<&NestedTensor>,
) -> Result<NestedTensor> {
    if let Some(prebuilt) = prebuilt {
        prebuilt.try_map_with_path(|path, leaf| {
            checks::expect_stage_dim(&format!("prebuilt '{path}'"), leaf, num_stages)
        })?;
    }
    let mut stages = Vec::with_capacity(num_stages);
    for (stage, stage_key) in key.split(num_stages).into_iter().enumerate() {
        let prebuilt_stage = prebuilt.map(|tree| tree.index(stage)).transpose()?;
        stages.push(init.initialize(stage_key, prebuilt_stage.as_ref())?);
    }
    log::debug!("initialized {num_stages} stacked stages");
    NestedTensor::stack(&stages, 0)
}

/// Initialiser driven by a tree of per-stage [`ParameterSpec`]s.
#[derive(Debug, Clone)]
pub struct SpecInitializer {
    specs: Nested<ParameterSpec>,
    device: Device,
}

impl SpecInitializer {
    pub fn new(specs: Nested<ParameterSpec>, device: Device) -> Self {
        Self { specs, device }
    }

    pub fn specs(&self) -> &Nested<ParameterSpec> {
        &self.specs
    }
}

impl StageInitializer for SpecInitializer {
    fn initialize(&self, key: PrngKey, prebuilt: Option<&NestedTensor>) -> Result<NestedTensor> {
        let mut index = 0u64;
        self.specs.try_map_with_path(|path, spec| {
            let leaf_key = key.fold_in(index);
            index += 1;
            match prebuilt.and_then(|tree| tree.get_path(path)).and_then(Nested::as_leaf) {
                Some(existing) if existing.dims() == spec.shape.as_slice() => Ok(existing.clone()),
                Some(existing) => Err(PipelineError::invalid_shape(
                    format!("prebuilt '{path}'"),
                    format!("{:?}", spec.shape),
                    existing.dims(),
                )),
                None => spec.sample(leaf_key, &self.device),
            }
        })
    }
}

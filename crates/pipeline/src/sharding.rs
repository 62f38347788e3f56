//! Placement hints for pipelined tensors.
//!
//! The scheduler never moves data between devices itself. Instead it calls a
//! [`ShardingConstraint`] at the points where a tensor is in a layout whose
//! axes are meaningful for placement: right after a reshape restores the
//! constrained axis, never in the middle of a transform. Single-device runs use
//! [`Unconstrained`], which only validates the hint.

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::nested::Nested;

/// Name of the mesh axis that stacked per-stage tensors are sharded along.
pub const PIPELINE_AXIS: &str = "pipeline";

/// Placement of a single tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshAxis {
    /// Split across the named mesh axis.
    Named(String),
    /// Explicitly replicated.
    Replicated,
    /// Left to the execution substrate.
    Unconstrained,
}

impl MeshAxis {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

/// Per-dimension placement; trailing dims not listed are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSpec(pub Vec<MeshAxis>);

impl PartitionSpec {
    pub fn new(axes: Vec<MeshAxis>) -> Self {
        Self(axes)
    }

    /// `rank` unconstrained dims.
    pub fn unconstrained(rank: usize) -> Self {
        Self(vec![MeshAxis::Unconstrained; rank])
    }

    /// Sharded over [`PIPELINE_AXIS`] on axis 0, unconstrained elsewhere.
    pub fn stage_sharded(rank: usize) -> Self {
        let mut axes = vec![MeshAxis::named(PIPELINE_AXIS)];
        axes.extend(std::iter::repeat(MeshAxis::Unconstrained).take(rank.saturating_sub(1)));
        Self(axes)
    }

    /// Returns a copy with `axis` inserted in front.
    pub fn prepend(&self, axis: MeshAxis) -> Self {
        let mut axes = Vec::with_capacity(self.0.len() + 1);
        axes.push(axis);
        axes.extend(self.0.iter().cloned());
        Self(axes)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|axis| match axis {
                MeshAxis::Named(name) => name.clone(),
                MeshAxis::Replicated => "None".to_string(),
                MeshAxis::Unconstrained => "*".to_string(),
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

pub type NestedPartitionSpec = Nested<PartitionSpec>;

/// Hook invoked wherever the pipeline pins the placement of a tensor.
pub trait ShardingConstraint: Send + Sync {
    fn constrain(&self, tensor: Tensor, spec: &PartitionSpec) -> Result<Tensor>;
}

/// Single-device placement: checks the hint fits the tensor and returns it unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconstrained;

impl ShardingConstraint for Unconstrained {
    fn constrain(&self, tensor: Tensor, spec: &PartitionSpec) -> Result<Tensor> {
        if spec.len() > tensor.rank() {
            return Err(PipelineError::invalid_shape(
                format!("partition spec {spec}"),
                format!("rank >= {}", spec.len()),
                tensor.dims(),
            ));
        }
        log::trace!("placement {spec} for shape {:?}", tensor.dims());
        Ok(tensor)
    }
}

/// Optional placement hints for the three pipeline inputs/outputs.
///
/// Missing hints default to: carry unconstrained, xs and ys sharded over
/// [`PIPELINE_AXIS`] along the stage axis.
#[derive(Debug, Clone, Default)]
pub struct PartitionHints {
    pub carry: Option<NestedPartitionSpec>,
    pub xs: Option<NestedPartitionSpec>,
    pub ys: Option<NestedPartitionSpec>,
}

impl PartitionHints {
    pub(crate) fn carry_or_default(&self, carry: &Nested<Tensor>) -> NestedPartitionSpec {
        self.carry
            .clone()
            .unwrap_or_else(|| carry.map(|leaf| PartitionSpec::unconstrained(leaf.rank())))
    }

    pub(crate) fn xs_or_default(&self, xs: &Nested<Tensor>) -> NestedPartitionSpec {
        self.xs
            .clone()
            .unwrap_or_else(|| xs.map(|leaf| PartitionSpec::stage_sharded(leaf.rank())))
    }

    pub(crate) fn ys_or_default(&self, ys: &Nested<Tensor>) -> NestedPartitionSpec {
        self.ys
            .clone()
            .unwrap_or_else(|| ys.map(|leaf| PartitionSpec::stage_sharded(leaf.rank())))
    }
}

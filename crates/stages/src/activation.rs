//! Pointwise non-linearities applied after the dense projection.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use pipeline::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageActivation {
    Identity,
    Relu,
    /// erf-based GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`.
    #[default]
    Gelu,
    Silu,
    Tanh,
}

impl StageActivation {
    pub fn forward(self, input: &Tensor) -> Result<Tensor> {
        let out = match self {
            StageActivation::Identity => input.clone(),
            StageActivation::Relu => input.relu()?,
            StageActivation::Gelu => input.gelu_erf()?,
            StageActivation::Silu => input.silu()?,
            StageActivation::Tanh => input.tanh()?,
        };
        Ok(out)
    }
}

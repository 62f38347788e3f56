//! Keyed inverted dropout.
//!
//! The mask is drawn from the caller's [`PrngKey`] alone, so a stage produces
//! the same mask whether it runs batched with its neighbours or on its own.

use candle_core::{Device, Tensor};
use rand::Rng;

use pipeline::{PrngKey, Result};

/// Keep-mask scaled by `1 / (1 - probability)`, shaped `dims`.
pub fn dropout_mask(
    key: PrngKey,
    dims: &[usize],
    probability: f32,
    device: &Device,
) -> Result<Tensor> {
    let keep_prob = 1.0 - probability;
    let scale = 1.0 / keep_prob;
    let total = dims.iter().product::<usize>();
    let mut rng = key.rng();
    let mask: Vec<f32> = (0..total)
        .map(|_| if rng.gen::<f32>() < keep_prob { scale } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(mask, dims, device)?)
}

/// Applies dropout with `probability`; `None`, `<= 0` or `>= 1` is a no-op.
pub fn apply_dropout(input: &Tensor, key: PrngKey, probability: Option<f32>) -> Result<Tensor> {
    match probability {
        Some(p) if p > 0.0 && p < 1.0 => {
            let mask = dropout_mask(key, input.dims(), p, input.device())?;
            Ok(input.mul(&mask.to_dtype(input.dtype())?)?)
        }
        _ => Ok(input.clone()),
    }
}

/// Per-stage masks stacked `[N, ...dims]`, stage `i` drawn from `keys[i]`.
pub fn stacked_dropout_mask(
    keys: &[PrngKey],
    dims: &[usize],
    probability: f32,
    device: &Device,
) -> Result<Tensor> {
    let masks = keys
        .iter()
        .map(|key| dropout_mask(*key, dims, probability, device))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&masks, 0)?)
}

//! Lightweight shape assertions used at the pipeline entry points.
//!
//! Each helper takes a `context` label that ends up in the error message so a
//! failing call can be traced back to the offending leaf.

use candle_core::Tensor;

use crate::error::{PipelineError, Result};

/// Ensures `tensor` has at least `min_rank` dimensions.
pub fn expect_rank_at_least(context: &str, tensor: &Tensor, min_rank: usize) -> Result<()> {
    if tensor.rank() >= min_rank {
        Ok(())
    } else {
        Err(PipelineError::invalid_shape(
            context,
            format!("rank >= {min_rank}"),
            tensor.dims(),
        ))
    }
}

/// Ensures the first dimension of `tensor` equals `expected`.
pub fn expect_leading_dim(context: &str, tensor: &Tensor, expected: usize) -> Result<()> {
    match tensor.dims().first() {
        Some(&actual) if actual == expected => Ok(()),
        _ => Err(PipelineError::invalid_shape(
            context,
            format!("leading dim {expected}"),
            tensor.dims(),
        )),
    }
}

/// Ensures a stacked per-stage tensor has one slice per stage.
pub fn expect_stage_dim(context: &str, tensor: &Tensor, num_stages: usize) -> Result<()> {
    match tensor.dims().first() {
        Some(&actual) if actual == num_stages => Ok(()),
        Some(&actual) => Err(PipelineError::StageCountMismatch {
            context: context.to_string(),
            expected: num_stages,
            actual,
        }),
        None => Err(PipelineError::invalid_shape(
            context,
            format!("leading stage dim {num_stages}"),
            tensor.dims(),
        )),
    }
}

/// Ensures the two leading dims of `tensor` are `(first, second)`.
pub fn expect_leading_pair(
    context: &str,
    tensor: &Tensor,
    first: usize,
    second: usize,
) -> Result<()> {
    match tensor.dims() {
        [a, b, ..] if *a == first && *b == second => Ok(()),
        dims => Err(PipelineError::LayoutMismatch {
            context: context.to_string(),
            expected_stages: first,
            expected_microbatches: second,
            actual: dims.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rank_check_rejects_scalars() -> candle_core::Result<()> {
        let scalar = Tensor::zeros((), DType::F32, &Device::Cpu)?;
        let err = expect_rank_at_least("carry", &scalar, 2).unwrap_err();
        assert!(err.to_string().contains("rank >= 2"));
        Ok(())
    }

    #[test]
    fn stage_dim_reports_observed_count() -> candle_core::Result<()> {
        let params = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        assert!(expect_stage_dim("w", &params, 3).is_ok());
        match expect_stage_dim("w", &params, 2) {
            Err(PipelineError::StageCountMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn leading_pair_mismatch_is_a_layout_error() -> candle_core::Result<()> {
        let x = Tensor::zeros((2, 5, 1), DType::F32, &Device::Cpu)?;
        assert!(expect_leading_pair("xs", &x, 2, 5).is_ok());
        assert!(matches!(
            expect_leading_pair("xs", &x, 5, 2),
            Err(PipelineError::LayoutMismatch { .. })
        ));
        Ok(())
    }
}

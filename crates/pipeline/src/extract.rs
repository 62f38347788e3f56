//! Turning the stacked timestep records back into caller-facing outputs.

use candle_core::Tensor;

use crate::checks;
use crate::error::{PipelineError, Result};
use crate::layout::PipelineLayout;
use crate::outputs::OutputCollection;
use crate::sharding::PartitionSpec;

/// Scope that receives the stage-major side outputs.
pub const LAYER_SCOPE: &str = "layer";

/// Last stage's carry for every microbatch.
///
/// `carry_stack` is `[M + N - 1, N, ...]`; microbatch `j` leaves stage `N - 1`
/// at timestep `j + N - 1`, so the result is `carry_stack[N-1.., N-1]`,
/// shaped `[M, ...]`.
pub fn extract_final_carry(
    carry_stack: &Tensor,
    num_stages: usize,
    num_microbatches: usize,
) -> Result<Tensor> {
    if num_stages == 0 || num_microbatches == 0 {
        return Err(PipelineError::LayoutMismatch {
            context: "stacked carry needs at least one stage and one microbatch".to_string(),
            expected_stages: num_stages,
            expected_microbatches: num_microbatches,
            actual: carry_stack.dims().to_vec(),
        });
    }
    let t = num_microbatches + num_stages - 1;
    checks::expect_rank_at_least("stacked carry", carry_stack, 2)?;
    match carry_stack.dims() {
        [a, b, ..] if *a == t && *b == num_stages => {}
        dims => {
            return Err(PipelineError::LayoutMismatch {
                context: format!("stacked carry (expects [{t}, {num_stages}, ...])"),
                expected_stages: num_stages,
                expected_microbatches: num_microbatches,
                actual: dims.to_vec(),
            })
        }
    }
    Ok(carry_stack
        .narrow(0, num_stages - 1, num_microbatches)?
        .narrow(1, num_stages - 1, 1)?
        .squeeze(1)?)
}

/// Copies every `[N, M, ...]` summary to `layer{i}/microbatch{j}/.../name`
/// with value `x[i, j]`.
pub fn split_summaries(
    stage_major: &OutputCollection,
    num_stages: usize,
    num_microbatches: usize,
) -> Result<OutputCollection> {
    fn collect<'a>(
        node: &'a OutputCollection,
        scope: &mut Vec<String>,
        out: &mut Vec<(Vec<String>, &'a str, &'a Tensor)>,
    ) {
        for (name, value) in &node.summaries {
            out.push((scope.clone(), name.as_str(), value));
        }
        for (name, child) in node.children() {
            scope.push(name.to_string());
            collect(child, scope, out);
            scope.pop();
        }
    }

    let mut summaries = Vec::new();
    collect(stage_major, &mut Vec::new(), &mut summaries);

    let mut result = OutputCollection::new();
    for (scope, name, value) in summaries {
        checks::expect_leading_pair(
            &format!("summary '{name}'"),
            value,
            num_stages,
            num_microbatches,
        )?;
        for stage in 0..num_stages {
            let per_stage = value.get(stage)?;
            for microbatch in 0..num_microbatches {
                let mut node = result
                    .add_child(format!("layer{stage}"))
                    .add_child(format!("microbatch{microbatch}"));
                for segment in &scope {
                    node = node.add_child(segment.as_str());
                }
                node.add_summary(name, per_stage.get(microbatch)?);
            }
        }
    }
    Ok(result)
}

/// Inverse-lays-out the stacked side outputs and files them under
/// [`LAYER_SCOPE`], plus the per-(layer, microbatch) summary split.
pub fn assemble_outputs(
    layout: &PipelineLayout,
    pipeline_major: &OutputCollection,
) -> Result<OutputCollection> {
    let stage_major = pipeline_major.try_map(|leaf| {
        layout.from_pipeline_major(leaf, Some(&PartitionSpec::stage_sharded(leaf.rank())))
    })?;
    let split = split_summaries(&stage_major, layout.num_stages(), layout.num_microbatches())?;

    let mut result = OutputCollection::new();
    result.add_child(LAYER_SCOPE).merge(stage_major)?;
    result.merge(split)?;
    Ok(result)
}

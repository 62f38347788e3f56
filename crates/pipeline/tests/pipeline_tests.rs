use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use pipeline::mask::valid_stages;
use pipeline::{
    ActivationPolicy, Nested, NestedTensor, PartitionHints, PartitionSpec, Pipeline,
    PipelineConfig, PipelineError, PipelineGradients, PrngKey, ShardingConstraint,
    StageComputation, StageOutput, Vectorized,
};

fn leaf<'a>(tree: &'a NestedTensor, path: &str) -> &'a Tensor {
    tree.get_path(path)
        .and_then(Nested::as_leaf)
        .unwrap_or_else(|| panic!("missing leaf '{path}'"))
}

/// `h + w[stage]`, emitting the new carry as `y` and its mean as a summary.
fn add_weight_stage() -> impl StageComputation {
    Vectorized::from_fn(|ctx, carry, _x| {
        let h = carry.as_leaf().unwrap();
        let out = h.add(ctx.param("w").unwrap())?;
        ctx.outputs.add_summary("mean", out.mean_all()?);
        ctx.outputs.add_module_output("h", out.clone());
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    })
}

/// `h * w[stage]`, broadcast over the microbatch rows.
fn scale_stage() -> impl StageComputation {
    Vectorized::from_fn(|ctx, carry, _x| {
        let out = carry.as_leaf().unwrap().broadcast_mul(ctx.param("w").unwrap())?;
        Ok(StageOutput::carry_only(out))
    })
}

/// `h + x`, where `x` is the stage's own input for the microbatch.
fn add_input_stage() -> impl StageComputation {
    Vectorized::from_fn(|_ctx, carry, x| {
        let out = carry.as_leaf().unwrap().add(x.as_leaf().unwrap())?;
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    })
}

fn weights(values: &[f32]) -> Result<NestedTensor> {
    let w = Tensor::from_slice(values, (values.len(), 1), &Device::Cpu)?;
    Ok(Nested::from_leaves([("w", w)]))
}

#[test]
fn single_stage_single_microbatch() -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(1, 1))?;
    let stage = Vectorized::from_fn(|_ctx, carry, _x| {
        let out = carry.as_leaf().unwrap().affine(2.0, 0.0)?;
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    });
    let carry = Nested::leaf(Tensor::new(&[[1f32, 2.]], &Device::Cpu)?);

    let out = pipeline.run(
        &stage,
        &Nested::default(),
        PrngKey::new(0),
        &carry,
        None,
        &PartitionHints::default(),
    )?;

    assert_eq!(out.carry.as_leaf().unwrap().to_vec2::<f32>()?, vec![vec![2.0, 4.0]]);
    assert_eq!(
        out.ys.as_leaf().unwrap().to_vec3::<f32>()?,
        vec![vec![vec![2.0, 4.0]]]
    );
    Ok(())
}

#[test]
fn three_stages_two_microbatches_follow_the_diagonal() -> Result<()> {
    let (n, m) = (3, 2);
    let valid: BTreeSet<(usize, usize)> = (0..m + n - 1)
        .flat_map(|t| {
            valid_stages(n, m, t)
                .into_iter()
                .enumerate()
                .filter(|(_, ok)| *ok)
                .map(move |(stage, _)| (stage, t))
        })
        .collect();
    let expected: BTreeSet<_> = [(0, 0), (1, 1), (0, 1), (2, 2), (1, 2), (2, 3)].into();
    assert_eq!(valid, expected);

    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?;
    let carry = Nested::leaf(Tensor::new(&[[0f32], [1000.]], &Device::Cpu)?);
    let out = pipeline.run(
        &add_weight_stage(),
        &weights(&[1.0, 10.0, 100.0])?,
        PrngKey::new(0),
        &carry,
        None,
        &PartitionHints::default(),
    )?;

    assert_eq!(
        out.carry.as_leaf().unwrap().to_vec2::<f32>()?,
        vec![vec![111.0], vec![1111.0]]
    );
    assert_eq!(
        out.ys.as_leaf().unwrap().to_vec3::<f32>()?,
        vec![
            vec![vec![1.0], vec![1001.0]],
            vec![vec![11.0], vec![1011.0]],
            vec![vec![111.0], vec![1111.0]],
        ]
    );
    Ok(())
}

#[test]
fn identity_stages_return_each_microbatch() -> Result<()> {
    let (n, m) = (2, 3);
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?;
    let identity = Vectorized::from_fn(|_ctx, carry, _x| {
        Ok(StageOutput::new(carry.clone(), carry.clone()))
    });
    let micro = Tensor::new(&[[1f32, -1.], [2., -2.], [3., -3.]], &Device::Cpu)?;
    let carry = Nested::from_leaves([("h", micro.clone())]);

    let out = pipeline.run(
        &identity,
        &Nested::default(),
        PrngKey::new(0),
        &carry,
        None,
        &PartitionHints::default(),
    )?;

    let ys = leaf(&out.ys, "h");
    assert_eq!(ys.dims(), &[n, m, 2]);
    for i in 0..n {
        assert_eq!(ys.get(i)?.to_vec2::<f32>()?, micro.to_vec2::<f32>()?);
    }
    assert_eq!(leaf(&out.carry, "h").to_vec2::<f32>()?, micro.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn per_stage_inputs_are_delivered_on_the_diagonal() -> Result<()> {
    let (n, m) = (2, 3);
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?;
    // xs[i, j] = 10 * i + j.
    let values: Vec<f32> = (0..n)
        .flat_map(|i| (0..m).map(move |j| (10 * i + j) as f32))
        .collect();
    let xs = Nested::leaf(Tensor::from_vec(values, (n, m, 1), &Device::Cpu)?);
    let carry = Nested::leaf(Tensor::zeros((m, 1), DType::F32, &Device::Cpu)?);

    let out = pipeline.run(
        &add_input_stage(),
        &Nested::default(),
        PrngKey::new(0),
        &carry,
        Some(&xs),
        &PartitionHints::default(),
    )?;

    assert_eq!(
        out.carry.as_leaf().unwrap().to_vec2::<f32>()?,
        vec![vec![10.0], vec![12.0], vec![14.0]]
    );
    assert_eq!(
        out.ys.as_leaf().unwrap().to_vec3::<f32>()?,
        vec![
            vec![vec![0.0], vec![1.0], vec![2.0]],
            vec![vec![10.0], vec![12.0], vec![14.0]],
        ]
    );
    Ok(())
}

#[test]
fn gradient_matches_the_sequential_composition() -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(2, 2))?;
    let w = Var::from_tensor(&Tensor::new(&[[0.5f32], [4.0]], &Device::Cpu)?)?;
    let params = Nested::from_leaves([("w", w.as_tensor().clone())]);
    let carry = Nested::leaf(Tensor::new(&[[2f32], [3.]], &Device::Cpu)?);

    let out = pipeline.run(
        &scale_stage(),
        &params,
        PrngKey::new(0),
        &carry,
        None,
        &PartitionHints::default(),
    )?;
    // final[j] = x[j] * w0 * w1.
    let final_carry = out.carry.as_leaf().unwrap();
    assert_eq!(final_carry.to_vec2::<f32>()?, vec![vec![4.0], vec![6.0]]);

    let grads = final_carry.sum_all()?.backward()?;
    let grad = grads.get(w.as_tensor()).expect("gradient for w");
    // d/dw0 = (2 + 3) * w1, d/dw1 = (2 + 3) * w0.
    assert_eq!(grad.to_vec2::<f32>()?, vec![vec![20.0], vec![2.5]]);
    Ok(())
}

#[test]
fn bubble_fill_never_reaches_valid_outputs() -> Result<()> {
    let run = |fill: f64| -> Result<(Vec<Vec<f32>>, Vec<Vec<Vec<f32>>>)> {
        let pipeline = Pipeline::new(PipelineConfig::new(3, 2).with_bubble_fill(fill))?;
        let carry = Nested::leaf(Tensor::new(&[[5f32], [7.]], &Device::Cpu)?);
        let out = pipeline.run(
            &add_weight_stage(),
            &weights(&[1.0, 2.0, 3.0])?,
            PrngKey::new(0),
            &carry,
            None,
            &PartitionHints::default(),
        )?;
        Ok((
            out.carry.as_leaf().unwrap().to_vec2::<f32>()?,
            out.ys.as_leaf().unwrap().to_vec3::<f32>()?,
        ))
    };
    assert_eq!(run(0.0)?, run(7.5)?);
    Ok(())
}

fn gradients_under(
    policy: ActivationPolicy,
    stage: &dyn StageComputation,
    params: &NestedTensor,
    carry: &NestedTensor,
    xs: Option<&NestedTensor>,
    n: usize,
    m: usize,
) -> Result<PipelineGradients> {
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?.with_activation_policy(policy);
    Ok(pipeline.value_and_grad(
        stage,
        params,
        PrngKey::new(4),
        carry,
        xs,
        &PartitionHints::default(),
        |out| {
            let carry = out.carry.as_leaf().unwrap().sum_all()?;
            let ys = out.ys.as_leaf().unwrap().sqr()?.sum_all()?;
            Ok(carry.add(&ys)?)
        },
    )?)
}

fn assert_close(actual: &Tensor, expected: &Tensor) -> Result<()> {
    assert_eq!(actual.dims(), expected.dims());
    let diff = actual
        .sub(expected)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-4, "{actual} vs {expected}");
    Ok(())
}

#[test]
fn value_and_grad_matches_the_sequential_composition() -> Result<()> {
    let params = weights(&[0.5, 4.0])?;
    let carry = Nested::leaf(Tensor::new(&[[2f32], [3.]], &Device::Cpu)?);
    for policy in [ActivationPolicy::Save, ActivationPolicy::Recompute] {
        let pipeline = Pipeline::new(PipelineConfig::new(2, 2))?.with_activation_policy(policy);
        let grads = pipeline.value_and_grad(
            &scale_stage(),
            &params,
            PrngKey::new(0),
            &carry,
            None,
            &PartitionHints::default(),
            |out| Ok(out.carry.as_leaf().unwrap().sum_all()?),
        )?;
        assert_eq!(grads.loss.to_scalar::<f32>()?, 10.0, "{policy:?}");
        assert_eq!(
            leaf(&grads.params, "w").to_vec2::<f32>()?,
            vec![vec![20.0], vec![2.5]],
            "{policy:?}"
        );
        // d final[j] / d x[j] = w0 * w1.
        assert_eq!(
            grads.carry.as_leaf().unwrap().to_vec2::<f32>()?,
            vec![vec![2.0], vec![2.0]],
            "{policy:?}"
        );
    }
    Ok(())
}

#[test]
fn recomputing_activations_reproduces_saved_gradients() -> Result<()> {
    let (n, m) = (3, 4);
    let device = Device::Cpu;
    // tanh(h * w + x) keeps every timestep's Jacobian input-dependent.
    let stage = Vectorized::from_fn(|ctx, carry, x| {
        let h = carry.as_leaf().unwrap();
        let out = h
            .broadcast_mul(ctx.param("w").unwrap())?
            .add(x.as_leaf().unwrap())?
            .tanh()?;
        ctx.outputs.add_summary("mean", out.mean_all()?);
        Ok(StageOutput::new(Nested::leaf(out.clone()), Nested::leaf(out)))
    });
    let params = Nested::from_leaves([("w", Tensor::randn(0f32, 1.0, (n, 2), &device)?)]);
    let carry = Nested::leaf(Tensor::randn(0f32, 1.0, (m, 2), &device)?);
    let xs = Nested::leaf(Tensor::randn(0f32, 0.5, (n, m, 2), &device)?);

    let saved = gradients_under(ActivationPolicy::Save, &stage, &params, &carry, Some(&xs), n, m)?;
    let recomputed =
        gradients_under(ActivationPolicy::Recompute, &stage, &params, &carry, Some(&xs), n, m)?;

    assert_close(&recomputed.loss, &saved.loss)?;
    assert_close(leaf(&recomputed.params, "w"), leaf(&saved.params, "w"))?;
    assert_close(
        recomputed.carry.as_leaf().unwrap(),
        saved.carry.as_leaf().unwrap(),
    )?;
    assert_close(
        recomputed.xs.as_ref().unwrap().as_leaf().unwrap(),
        saved.xs.as_ref().unwrap().as_leaf().unwrap(),
    )?;
    assert_close(
        recomputed.output.outputs.summary("layer/mean").unwrap(),
        saved.output.outputs.summary("layer/mean").unwrap(),
    )?;
    let norm = leaf(&saved.params, "w").abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(norm > 0.0);
    Ok(())
}

#[test]
fn summaries_are_split_per_layer_and_microbatch() -> Result<()> {
    let (n, m) = (3, 2);
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?;
    let carry = Nested::leaf(Tensor::new(&[[0f32], [1000.]], &Device::Cpu)?);
    let out = pipeline.run(
        &add_weight_stage(),
        &weights(&[1.0, 10.0, 100.0])?,
        PrngKey::new(0),
        &carry,
        None,
        &PartitionHints::default(),
    )?;

    let stacked = out.outputs.summary("layer/mean").expect("stacked summary");
    assert_eq!(stacked.dims(), &[n, m]);
    let module_output = &out.outputs.scope("layer").unwrap().module_outputs["h"];
    assert_eq!(module_output.dims(), &[n, m, 1]);

    for (i, offset) in [1f32, 11., 111.].into_iter().enumerate() {
        for (j, base) in [0f32, 1000.].into_iter().enumerate() {
            let value = out
                .outputs
                .summary(&format!("layer{i}/microbatch{j}/mean"))
                .expect("split summary");
            assert_eq!(value.to_scalar::<f32>()?, base + offset);
        }
    }
    Ok(())
}

#[test]
fn every_stage_and_timestep_gets_its_own_key() -> Result<()> {
    let (n, m) = (2, 3);
    let seen = Mutex::new(Vec::new());
    let stage = Vectorized::from_fn(|ctx, carry, _x| {
        seen.lock().unwrap().push(ctx.key.raw());
        Ok(StageOutput::carry_only(carry.as_leaf().unwrap().clone()))
    });
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?;
    let carry = Nested::leaf(Tensor::zeros((m, 1), DType::F32, &Device::Cpu)?);
    let key = PrngKey::new(9);
    pipeline.run(
        &stage,
        &Nested::default(),
        key,
        &carry,
        None,
        &PartitionHints::default(),
    )?;

    let seen = seen.into_inner().unwrap();
    let expected: Vec<u64> = key.split((m + n - 1) * n).iter().map(|k| k.raw()).collect();
    assert_eq!(seen, expected);
    assert_eq!(seen.iter().collect::<BTreeSet<_>>().len(), seen.len());
    Ok(())
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(String, Vec<usize>)>>);

impl ShardingConstraint for Recorder {
    fn constrain(&self, tensor: Tensor, spec: &PartitionSpec) -> pipeline::Result<Tensor> {
        self.0
            .lock()
            .unwrap()
            .push((spec.to_string(), tensor.dims().to_vec()));
        Ok(tensor)
    }
}

#[test]
fn placement_hints_are_applied_at_each_layout_boundary() -> Result<()> {
    let (n, m) = (2, 3);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::new(PipelineConfig::new(n, m))?.with_sharding(recorder.clone());
    let xs = Nested::leaf(Tensor::zeros((n, m, 1), DType::F32, &Device::Cpu)?);
    let carry = Nested::leaf(Tensor::zeros((m, 1), DType::F32, &Device::Cpu)?);
    pipeline.run(
        &add_input_stage(),
        &Nested::default(),
        PrngKey::new(0),
        &carry,
        Some(&xs),
        &PartitionHints::default(),
    )?;

    let calls = recorder.0.lock().unwrap().clone();
    for expected in [
        ("(*, *)".to_string(), vec![m, n, 1]),
        ("(pipeline, *, *)".to_string(), vec![n, m + n - 1, 1]),
        ("(*, *)".to_string(), vec![m, 1]),
        ("(pipeline, *, *)".to_string(), vec![n, m + n, 1]),
    ] {
        assert!(calls.contains(&expected), "missing {expected:?} in {calls:?}");
    }
    Ok(())
}

#[test]
fn batched_entry_point_round_trips_the_batch() -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(2, 2))?;
    let batch = Tensor::new(&[[1f32], [2.], [3.], [4.]], &Device::Cpu)?;
    let out = pipeline.run_batched(
        &scale_stage(),
        &weights(&[2.0, 3.0])?,
        PrngKey::new(0),
        &Nested::leaf(batch),
        &PartitionHints::default(),
    )?;
    assert_eq!(
        out.carry.as_leaf().unwrap().to_vec2::<f32>()?,
        vec![vec![6.0], vec![12.0], vec![18.0], vec![24.0]]
    );
    Ok(())
}

#[test]
fn malformed_inputs_are_rejected_before_running() -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(2, 2))?;
    let device = Device::Cpu;
    let run = |params: &NestedTensor, carry: &NestedTensor, xs: Option<&NestedTensor>| {
        pipeline.run(
            &scale_stage(),
            params,
            PrngKey::new(0),
            carry,
            xs,
            &PartitionHints::default(),
        )
    };
    let params = weights(&[1.0, 1.0])?;
    let good_carry = Nested::leaf(Tensor::zeros((2, 1), DType::F32, &device)?);

    assert!(matches!(
        run(&params, &Nested::default(), None),
        Err(PipelineError::EmptyCarry)
    ));
    assert!(matches!(
        run(&params, &Nested::leaf(Tensor::zeros(2, DType::F32, &device)?), None),
        Err(PipelineError::InvalidShape { .. })
    ));
    assert!(matches!(
        run(&params, &Nested::leaf(Tensor::zeros((3, 1), DType::F32, &device)?), None),
        Err(PipelineError::InvalidShape { .. })
    ));
    let bad_xs = Nested::leaf(Tensor::zeros((2, 3, 1), DType::F32, &device)?);
    assert!(matches!(
        run(&params, &good_carry, Some(&bad_xs)),
        Err(PipelineError::LayoutMismatch { .. })
    ));
    assert!(matches!(
        run(&weights(&[1.0, 1.0, 1.0])?, &good_carry, None),
        Err(PipelineError::StageCountMismatch { .. })
    ));
    assert!(matches!(
        Pipeline::new(PipelineConfig::new(0, 2)),
        Err(PipelineError::Validation(_))
    ));
    Ok(())
}

#[test]
fn config_files_load_by_extension() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let toml_path = dir.path().join("pipeline.toml");
    std::fs::write(
        &toml_path,
        "num_stages = 4\nnum_microbatches = 8\nactivation_policy = \"recompute\"\n",
    )?;
    let config = PipelineConfig::from_path(&toml_path)?;
    assert_eq!(config.num_timesteps(), 11);
    assert_eq!(config.activation_policy, ActivationPolicy::Recompute);

    let json_path = dir.path().join("pipeline.json");
    std::fs::write(
        &json_path,
        r#"{"num_stages": 2, "num_microbatches": 3, "bubble_fill": 1.5, "seed": 7}"#,
    )?;
    let config = PipelineConfig::from_path(&json_path)?;
    assert_eq!(config.seed, 7);
    assert_eq!(config.bubble_fill, 1.5);
    let pipeline = Pipeline::new(config)?;
    assert_eq!(pipeline.layout().num_timesteps(), 4);
    assert_eq!(pipeline.root_key(), PrngKey::new(7));

    let yaml_path = dir.path().join("pipeline.yaml");
    std::fs::write(&yaml_path, "num_stages: 1")?;
    assert!(matches!(
        PipelineConfig::from_path(&yaml_path),
        Err(PipelineError::ConfigFormat(_))
    ));

    let invalid_path = dir.path().join("invalid.toml");
    std::fs::write(&invalid_path, "num_stages = 0\nnum_microbatches = 0\n")?;
    match PipelineConfig::from_path(&invalid_path) {
        Err(PipelineError::Validation(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

mod thread_safety {
    use pipeline::{
        CheckpointTape, OutputCollection, Pipeline, PipelineLayout, PipelineOutput, PrngKey,
        SpecInitializer,
    };
    use static_assertions::assert_impl_all;

    assert_impl_all!(Pipeline: Send, Sync);
    assert_impl_all!(PipelineLayout: Send, Sync);
    assert_impl_all!(PipelineOutput: Send, Sync);
    assert_impl_all!(OutputCollection: Send, Sync);
    assert_impl_all!(PrngKey: Send, Sync, Copy);
    assert_impl_all!(SpecInitializer: Send, Sync);
    assert_impl_all!(CheckpointTape: Send, Sync);
}

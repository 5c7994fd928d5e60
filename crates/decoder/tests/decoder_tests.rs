use std::io::Write;

use attention::{AttentionType, ContentFunction};
use candle_core::{DType, Device, Tensor};
use decoder::{
    AttentionDecoder, DecoderConfig, DecoderError, EmbeddingAttentionDecoder, FeedbackPolicy,
    OutputProjection, Phase, PriorHistory, RecurrentCell, StackedGru,
};
use layers::{LinearInit, ParameterStore};

const BATCH: usize = 2;
const SOURCE_LEN: usize = 4;
const HIDDEN: usize = 3;

fn store() -> ParameterStore {
    ParameterStore::new(&Device::Cpu, DType::F32, 1234)
}

fn gru(store: &mut ParameterStore, input_size: usize) -> anyhow::Result<StackedGru> {
    Ok(StackedGru::new(
        store,
        "gru",
        input_size,
        HIDDEN,
        1,
        &LinearInit::default(),
    )?)
}

fn encoder_states(seed: f64) -> candle_core::Result<Tensor> {
    Tensor::arange(0f32, (BATCH * SOURCE_LEN * HIDDEN) as f32, &Device::Cpu)?
        .reshape((BATCH, SOURCE_LEN, HIDDEN))?
        .affine(0.1, seed)?
        .sin()
}

fn step_inputs(steps: usize, width: usize) -> candle_core::Result<Vec<Tensor>> {
    (0..steps)
        .map(|step| {
            Tensor::arange(0f32, (BATCH * width) as f32, &Device::Cpu)?
                .reshape((BATCH, width))?
                .affine(0.3, step as f64)?
                .cos()
        })
        .collect()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
}

#[test]
fn end_to_end_global_additive_scenario() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.output_size = Some(5);
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;

    let initial = decoder.cell().zero_state(BATCH)?;
    let output = decoder.decode(
        &step_inputs(3, HIDDEN)?,
        &initial,
        &encoder_states(0.0)?,
        None,
        None,
    )?;

    assert_eq!(output.outputs.len(), 3);
    for out in &output.outputs {
        assert_eq!(out.dims(), &[BATCH, 5]);
        assert!(out.abs()?.max_all()?.to_vec0::<f32>()? <= 1.0);
    }
    assert_eq!(output.final_state.dims(), initial.dims());
    assert_eq!(output.history.dims(), &[BATCH, 3, HIDDEN]);
    assert_eq!(output.attention.len(), 3);
    for step in &output.attention {
        assert_eq!(step.context.dims(), &[BATCH, HIDDEN]);
        for row in step.weights.to_vec2::<f32>()? {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn decoding_is_deterministic_for_a_fixed_seed() -> anyhow::Result<()> {
    let run = || -> anyhow::Result<Vec<Vec<f32>>> {
        let mut store = store();
        let cell = gru(&mut store, HIDDEN)?;
        let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Hybrid);
        config.window_size = 2;
        let decoder = AttentionDecoder::new(config, cell, &mut store)?;
        let initial = decoder.cell().zero_state(BATCH)?;
        let output = decoder.decode(
            &step_inputs(4, HIDDEN)?,
            &initial,
            &encoder_states(0.5)?,
            None,
            None,
        )?;
        Ok(output
            .outputs
            .iter()
            .map(|t| t.flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<_>>()?)
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn every_attention_type_and_content_function_decodes() -> anyhow::Result<()> {
    let functions = [
        ContentFunction::Dot,
        ContentFunction::General,
        ContentFunction::Additive,
        ContentFunction::AdditiveReduced,
        ContentFunction::AdditiveRelu,
        ContentFunction::AdditiveBahdanau,
    ];
    for attention_type in [AttentionType::Global, AttentionType::Local, AttentionType::Hybrid] {
        for function in functions {
            let mut store = store();
            let cell = gru(&mut store, HIDDEN)?;
            let mut config = DecoderConfig::new(HIDDEN, 10, attention_type);
            config.content_function = function;
            config.window_size = 1;
            let decoder = AttentionDecoder::new(config, cell, &mut store)?;
            let initial = decoder.cell().zero_state(BATCH)?;
            let output = decoder.decode(
                &step_inputs(3, HIDDEN)?,
                &initial,
                &encoder_states(1.0)?,
                None,
                None,
            )?;
            for step in &output.attention {
                assert_eq!(
                    step.context.dims(),
                    &[BATCH, HIDDEN],
                    "{attention_type}/{function}"
                );
                if let Some(centres) = &step.window_centres {
                    assert!(centres.iter().all(|c| (0.0..SOURCE_LEN as f32).contains(c)));
                }
            }
        }
    }
    Ok(())
}

#[test]
fn input_feeding_concatenates_previous_context() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, 2 * HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Local);
    config.input_feeding = true;
    config.window_size = 2;
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    assert_eq!(decoder.input_size(), HIDDEN);

    let initial = decoder.cell().zero_state(BATCH)?;
    let output = decoder.decode(
        &step_inputs(3, HIDDEN)?,
        &initial,
        &encoder_states(0.0)?,
        None,
        None,
    )?;
    assert_eq!(output.outputs.len(), 3);

    let too_wide = step_inputs(1, 2 * HIDDEN)?;
    let err = decoder
        .decode(&too_wide, &initial, &encoder_states(0.0)?, None, None)
        .unwrap_err();
    assert!(matches!(err, DecoderError::Shape { .. }));
    Ok(())
}

#[test]
fn combine_maps_input_and_context_to_cell_width() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, 4)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.combine_input_attention = true;
    config.input_size = Some(5);
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    assert_eq!(
        store
            .get("attention_decoder/combine/weight")
            .map(|v| v.dims().to_vec()),
        Some(vec![4, 5 + HIDDEN])
    );

    let initial = decoder.cell().zero_state(BATCH)?;
    let output = decoder.decode(
        &step_inputs(2, 5)?,
        &initial,
        &encoder_states(0.0)?,
        None,
        None,
    )?;
    assert_eq!(output.outputs.len(), 2);
    Ok(())
}

#[test]
fn feedback_replaces_inputs_after_the_first_step() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.output_size = Some(HIDDEN);
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let states = encoder_states(0.0)?;

    let zeros = |prev: &Tensor, _step: usize| -> Result<Tensor, DecoderError> {
        Ok(prev.zeros_like()?)
    };
    let inputs = step_inputs(3, HIDDEN)?;
    let fed = decoder.decode(&inputs, &initial, &states, Some(&zeros as &dyn FeedbackPolicy), None)?;

    let zero = Tensor::zeros((BATCH, HIDDEN), DType::F32, &Device::Cpu)?;
    let manual_inputs = vec![inputs[0].clone(), zero.clone(), zero];
    let manual = decoder.decode(&manual_inputs, &initial, &states, None, None)?;

    for (a, b) in fed.outputs.iter().zip(manual.outputs.iter()) {
        assert!(max_abs_diff(a, b)? < 1e-6);
    }
    Ok(())
}

#[test]
fn output_attention_continues_from_prior_history() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.output_attention = true;
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let states = encoder_states(0.2)?;
    let inputs = step_inputs(3, HIDDEN)?;

    let full = decoder.decode(&inputs, &initial, &states, None, None)?;

    let first = decoder.decode(&inputs[..2], &initial, &states, None, None)?;
    assert_eq!(first.history.dims(), &[BATCH, 2, HIDDEN]);
    let prior = PriorHistory::new(first.history.clone(), 2);
    let second = decoder.decode(&inputs[2..], &first.final_state, &states, None, Some(prior))?;

    assert_eq!(second.history.dims(), &[BATCH, 3, HIDDEN]);
    assert!(max_abs_diff(&second.history, &full.history)? < 1e-6);
    assert!(max_abs_diff(&second.outputs[0], &full.outputs[2])? < 1e-5);

    let wrong = PriorHistory::new(first.history, 5);
    let err = decoder
        .decode(&inputs[2..], &first.final_state, &states, None, Some(wrong))
        .unwrap_err();
    assert!(matches!(err, DecoderError::History { .. }));
    Ok(())
}

#[test]
fn prior_history_requires_output_attention() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let decoder = AttentionDecoder::new(
        DecoderConfig::new(HIDDEN, 10, AttentionType::Global),
        cell,
        &mut store,
    )?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let prior = PriorHistory::new(Tensor::zeros((BATCH, 1, HIDDEN), DType::F32, &Device::Cpu)?, 1);
    let err = decoder
        .decode(&step_inputs(1, HIDDEN)?, &initial, &encoder_states(0.0)?, None, Some(prior))
        .unwrap_err();
    assert!(matches!(err, DecoderError::History { .. }));
    Ok(())
}

#[test]
fn bahdanau_queries_zeros_at_the_first_step() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.content_function = ContentFunction::AdditiveBahdanau;
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let states = encoder_states(0.0)?;

    let a = decoder.decode(&step_inputs(2, HIDDEN)?, &initial, &states, None, None)?;
    let shifted: Vec<Tensor> = step_inputs(2, HIDDEN)?
        .into_iter()
        .map(|t| t.affine(-2.0, 0.5))
        .collect::<candle_core::Result<_>>()?;
    let b = decoder.decode(&shifted, &initial, &states, None, None)?;

    // Step 0 attends with the same zero query regardless of the input.
    assert!(max_abs_diff(&a.attention[0].weights, &b.attention[0].weights)? < 1e-7);
    // Step 1 queries with the step-0 cell output, which differs.
    assert!(max_abs_diff(&a.attention[1].weights, &b.attention[1].weights)? > 0.0);
    Ok(())
}

#[test]
fn session_walks_through_its_phases() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let decoder = AttentionDecoder::new(
        DecoderConfig::new(HIDDEN, 10, AttentionType::Local),
        cell,
        &mut store,
    )?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let inputs = step_inputs(2, HIDDEN)?;

    let mut session = decoder.start(2, &initial, &encoder_states(0.0)?, None, None)?;
    assert_eq!(session.phase(), Phase::Init);
    session.step(&inputs[0])?;
    assert_eq!(session.phase(), Phase::Stepping(1));
    session.step(&inputs[1])?;
    assert_eq!(session.phase(), Phase::Done);
    assert!(matches!(
        session.step(&inputs[1]),
        Err(DecoderError::Session { .. })
    ));
    let output = session.finish()?;
    assert_eq!(output.outputs.len(), 2);

    let mut early = decoder.start(3, &initial, &encoder_states(0.0)?, None, None)?;
    early.step(&inputs[0])?;
    assert!(matches!(early.finish(), Err(DecoderError::Session { .. })));
    Ok(())
}

#[test]
fn dropout_sets_cell_keep_probability() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.dropout = Some(0.25);
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    assert_eq!(decoder.cell().keep_prob(), 0.75);
    Ok(())
}

#[test]
fn missing_attention_type_fails_before_registration() -> anyhow::Result<()> {
    let mut cell_store = store();
    let cell = gru(&mut cell_store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.attention_type = None;

    let mut store = store();
    let result = AttentionDecoder::new(config, cell, &mut store);
    assert!(matches!(result, Err(DecoderError::Validation(_))));
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn mismatched_output_projection_is_rejected_up_front() -> anyhow::Result<()> {
    let mut cell_store = store();
    let cell = gru(&mut cell_store, HIDDEN)?;
    let config = DecoderConfig::new(HIDDEN, 7, AttentionType::Global);
    let projection = OutputProjection::new(
        Tensor::zeros((HIDDEN, 6), DType::F32, &Device::Cpu)?,
        Tensor::zeros(7, DType::F32, &Device::Cpu)?,
    );

    let mut store = store();
    let err = EmbeddingAttentionDecoder::new(config, cell, &mut store, Some(projection))
        .err()
        .expect("projection mismatch");
    match err {
        DecoderError::Validation(messages) => {
            assert!(messages.iter().any(|m| m.contains("weight")));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn embedding_decoder_feeds_back_argmax_symbols() -> anyhow::Result<()> {
    let num_symbols = 6;
    let mut store = store();
    let cell = gru(&mut store, 2 * HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, num_symbols, AttentionType::Hybrid);
    config.input_feeding = true;
    config.feed_previous = true;
    config.window_size = 2;
    let projection = OutputProjection::new(
        Tensor::randn(0f32, 1.0, (HIDDEN, num_symbols), &Device::Cpu)?,
        Tensor::zeros(num_symbols, DType::F32, &Device::Cpu)?,
    );
    let decoder = EmbeddingAttentionDecoder::new(config, cell, &mut store, Some(projection))?;
    assert_eq!(decoder.embedding().weight().dims(), &[num_symbols, HIDDEN]);
    assert!(store.get("embedding_attention_decoder/embedding").is_some());
    assert!(store
        .get("embedding_attention_decoder/attention_decoder/attention/gate/weight")
        .is_some());

    let symbols: Vec<Tensor> = (0..3)
        .map(|step| Tensor::new(&[step as u32, 5], &Device::Cpu))
        .collect::<candle_core::Result<_>>()?;
    let initial = decoder.decoder().cell().zero_state(BATCH)?;
    let output = decoder.decode(&symbols, &initial, &encoder_states(0.0)?, None)?;
    assert_eq!(output.outputs.len(), 3);
    for out in &output.outputs {
        assert_eq!(out.dims(), &[BATCH, HIDDEN]);
    }
    Ok(())
}

#[test]
fn config_file_drives_decoder_construction() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
    write!(
        file,
        r#"{{
            "hidden_size": 3,
            "num_symbols": 12,
            "attention_type": "local",
            "content_function": "luong_general",
            "window_size": 2,
            "output_size": 4,
            "init": {{ "low": -0.05, "high": 0.05, "seed": 7 }}
        }}"#
    )?;
    let config = DecoderConfig::from_path(file.path())?;
    assert_eq!(config.content_function, ContentFunction::General);
    assert_eq!(config.init.seed, 7);

    let mut store = ParameterStore::new(&Device::Cpu, DType::F32, config.init.seed);
    let cell = gru(&mut store, HIDDEN)?;
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    let initial = decoder.cell().zero_state(BATCH)?;
    let output = decoder.decode(
        &step_inputs(2, HIDDEN)?,
        &initial,
        &encoder_states(0.0)?,
        None,
        None,
    )?;
    assert_eq!(output.outputs[1].dims(), &[BATCH, 4]);

    let mut bad = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    write!(bad, "hidden_size: 3")?;
    assert!(matches!(
        DecoderConfig::from_path(bad.path()),
        Err(DecoderError::ConfigFormat(_))
    ));
    Ok(())
}

#[test]
fn embedding_decoder_with_projection_accepts_feed_previous() -> anyhow::Result<()> {
    let num_symbols = 6;
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, num_symbols, AttentionType::Global);
    config.feed_previous = true;
    let projection = OutputProjection::new(
        Tensor::randn(0f32, 1.0, (HIDDEN, num_symbols), &Device::Cpu)?,
        Tensor::zeros(num_symbols, DType::F32, &Device::Cpu)?,
    );
    let decoder = EmbeddingAttentionDecoder::new(config, cell, &mut store, Some(projection))?;
    assert_eq!(decoder.decoder().output_size(), HIDDEN);

    let symbols = vec![Tensor::new(&[1u32, 2], &Device::Cpu)?; 2];
    let initial = decoder.decoder().cell().zero_state(BATCH)?;
    let output = decoder.decode(&symbols, &initial, &encoder_states(0.0)?, None)?;
    assert_eq!(output.outputs.len(), 2);
    Ok(())
}

#[test]
fn fed_back_outputs_carry_no_gradient() -> anyhow::Result<()> {
    let mut store = store();
    let cell = gru(&mut store, HIDDEN)?;
    let mut config = DecoderConfig::new(HIDDEN, 10, AttentionType::Global);
    config.output_size = Some(HIDDEN);
    let decoder = AttentionDecoder::new(config, cell, &mut store)?;
    let weight = store
        .get("attention_decoder/output_projection/weight")
        .expect("output projection weight")
        .clone();
    let initial = decoder.cell().zero_state(BATCH)?;
    let states = encoder_states(0.3)?;
    let inputs = step_inputs(2, HIDDEN)?;

    let identity = |prev: &Tensor, _step: usize| -> Result<Tensor, DecoderError> {
        Ok(prev.clone())
    };
    let fed = decoder.decode(&inputs, &initial, &states, Some(&identity as &dyn FeedbackPolicy), None)?;
    let fed_grads = fed.outputs[1].sum_all()?.backward()?;
    let fed_grad = fed_grads
        .get(weight.as_tensor())
        .expect("gradient for output projection")
        .clone();

    // Same second step, but with the first output supplied as a constant input.
    let constant_inputs = vec![inputs[0].clone(), fed.outputs[0].detach()];
    let constant = decoder.decode(&constant_inputs, &initial, &states, None, None)?;
    let constant_grads = constant.outputs[1].sum_all()?.backward()?;
    let constant_grad = constant_grads
        .get(weight.as_tensor())
        .expect("gradient for output projection");

    assert!(max_abs_diff(&fed.outputs[1], &constant.outputs[1])? < 1e-6);
    assert!(max_abs_diff(&fed_grad, constant_grad)? < 1e-6);
    Ok(())
}

//! Recurrent cell contract and a stacked GRU reference cell.
//!
//! The step loop only needs a cell that maps `(input, state)` to
//! `(output, new_state)` with fixed widths. States are opaque `[batch,
//! state_size]` tensors; stacked cells flatten their per-layer states along
//! the feature axis.

use std::sync::Mutex;

use candle_core::{Device, Tensor};
use layers::{
    activations::sigmoid, Linear, LinearConfig, LinearInit, ParameterStore, PrecisionPolicy,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::errors::DecoderError;

/// State transition unit driven once per decode step.
pub trait RecurrentCell {
    /// Width of the input expected by [`RecurrentCell::step`].
    fn input_size(&self) -> usize;

    /// Width of the output returned by [`RecurrentCell::step`].
    fn output_size(&self) -> usize;

    /// Width of the flattened state.
    fn state_size(&self) -> usize;

    fn zero_state(&self, batch: usize) -> Result<Tensor, DecoderError>;

    /// Advances one step, returning `(output, new_state)`.
    fn step(&self, input: &Tensor, state: &Tensor) -> Result<(Tensor, Tensor), DecoderError>;

    /// Input retention probability applied on every layer; `1.0` disables dropout.
    fn set_input_keep_prob(&mut self, keep_prob: f64) -> Result<(), DecoderError>;
}

#[derive(Debug)]
struct GruLayer {
    /// Fused reset and update gates over `[x, h]`.
    gates: Linear,
    /// Candidate over `[x, r * h]`.
    candidate: Linear,
}

/// Multi-layer GRU whose state is the concatenation of every layer's hidden vector.
#[derive(Debug)]
pub struct StackedGru {
    input_size: usize,
    hidden_size: usize,
    layers: Vec<GruLayer>,
    keep_prob: f64,
    rng: Mutex<StdRng>,
    device: Device,
    policy: PrecisionPolicy,
}

impl StackedGru {
    /// Registers `scope/layer_{i}/gates` and `scope/layer_{i}/candidate` for every layer.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        init: &LinearInit,
    ) -> Result<Self, DecoderError> {
        if input_size == 0 || hidden_size == 0 || num_layers == 0 {
            return Err(DecoderError::validation(vec![format!(
                "gru requires non-zero sizes, got input {input_size}, hidden {hidden_size}, layers {num_layers}"
            )]));
        }
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let layer_input = if layer == 0 { input_size } else { hidden_size };
            let mut gate_config = LinearConfig::new(layer_input + hidden_size, hidden_size);
            gate_config.fused_projections = 2;
            let gates = Linear::register(
                store,
                &format!("{scope}/layer_{layer}/gates"),
                gate_config,
                init,
            )?;
            let candidate = Linear::register(
                store,
                &format!("{scope}/layer_{layer}/candidate"),
                LinearConfig::new(layer_input + hidden_size, hidden_size),
                init,
            )?;
            layers.push(GruLayer { gates, candidate });
        }
        Ok(Self {
            input_size,
            hidden_size,
            layers,
            keep_prob: 1.0,
            rng: Mutex::new(StdRng::seed_from_u64(store.seed())),
            device: store.device().clone(),
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn keep_prob(&self) -> f64 {
        self.keep_prob
    }

    /// Inverted dropout on a layer input, drawing from the cell's seeded RNG.
    fn drop_input(&self, input: &Tensor) -> Result<Tensor, DecoderError> {
        if self.keep_prob >= 1.0 {
            return Ok(input.clone());
        }
        let count = input.elem_count();
        let scale = (1.0 / self.keep_prob) as f32;
        let mask: Vec<f32> = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| candle_core::Error::Msg("gru dropout rng poisoned".into()))?;
            (0..count)
                .map(|_| {
                    if rng.gen::<f64>() < self.keep_prob {
                        scale
                    } else {
                        0.0
                    }
                })
                .collect()
        };
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?.to_dtype(input.dtype())?;
        Ok(input.mul(&mask)?)
    }

    fn layer_step(
        &self,
        layer: &GruLayer,
        input: &Tensor,
        state: &Tensor,
    ) -> Result<Tensor, DecoderError> {
        let gates = layer.gates.forward_concat(&[input, state], &self.policy)?;
        let reset = sigmoid(&layer.gates.shard(&gates, 0)?)?;
        let update = sigmoid(&layer.gates.shard(&gates, 1)?)?;
        let gated_state = reset.mul(state)?;
        let candidate = layer
            .candidate
            .forward_concat(&[input, &gated_state], &self.policy)?
            .tanh()?;
        // h' = u * h + (1 - u) * c
        let keep = update.mul(state)?;
        let blend = update.affine(-1.0, 1.0)?.mul(&candidate)?;
        Ok(keep.add(&blend)?)
    }
}

impl RecurrentCell for StackedGru {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.hidden_size
    }

    fn state_size(&self) -> usize {
        self.hidden_size * self.layers.len()
    }

    fn zero_state(&self, batch: usize) -> Result<Tensor, DecoderError> {
        Ok(Tensor::zeros(
            (batch, self.state_size()),
            self.policy.storage(),
            &self.device,
        )?)
    }

    fn step(&self, input: &Tensor, state: &Tensor) -> Result<(Tensor, Tensor), DecoderError> {
        match (input.dims(), state.dims()) {
            ([b_in, w_in], [b_state, w_state])
                if *w_in == self.input_size && *w_state == self.state_size() && b_in == b_state => {}
            (input_dims, state_dims) => {
                return Err(DecoderError::shape(format!(
                    "gru step expected input [batch, {}] and state [batch, {}], got {:?} and {:?}",
                    self.input_size,
                    self.state_size(),
                    input_dims,
                    state_dims
                )))
            }
        }

        let mut layer_input = input.clone();
        let mut new_states = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_state = state.narrow(1, idx * self.hidden_size, self.hidden_size)?;
            let dropped = self.drop_input(&layer_input)?;
            let next = self.layer_step(layer, &dropped, &layer_state)?;
            new_states.push(next.clone());
            layer_input = next;
        }
        let new_state = Tensor::cat(&new_states, 1)?;
        Ok((layer_input, new_state))
    }

    fn set_input_keep_prob(&mut self, keep_prob: f64) -> Result<(), DecoderError> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(DecoderError::validation(vec![format!(
                "input keep probability must be in (0, 1], got {keep_prob}"
            )]));
        }
        self.keep_prob = keep_prob;
        Ok(())
    }
}

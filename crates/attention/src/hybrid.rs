//! Hybrid attention: a learned gate blending global and local contexts.
//!
//! `beta = sigmoid(sum(vb * tanh(W_b q + b_b)))` is computed per batch row and
//! the result is `beta * global + (1 - beta) * local` for both the context and
//! the reported weights. Each branch owns its scorer parameters; the encoder
//! memory is shared.

use candle_core::{Tensor, Var};
use layers::{
    activations::sigmoid, Linear, LinearConfig, LinearInit, LinearLayer, ParameterStore,
    PrecisionPolicy,
};

use crate::core::{AttentionError, AttentionOutput, ContentFunction, ContextAttention};
use crate::global::GlobalAttention;
use crate::local::LocalAttention;
use crate::scoring::EncoderMemory;

/// Both branch outputs plus the gate that blends them.
#[derive(Debug, Clone)]
pub struct HybridParts {
    pub global: AttentionOutput,
    pub local: AttentionOutput,
    /// `[batch, 1]`, strictly inside `(0, 1)`.
    pub gate: Tensor,
}

#[derive(Debug, Clone)]
pub struct HybridAttention {
    global: GlobalAttention,
    local: LocalAttention,
    gate: Linear,
    gate_vector: Var,
    policy: PrecisionPolicy,
}

impl HybridAttention {
    /// Registers `scope/global`, `scope/local`, `scope/gate` and `scope/vb`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        function: ContentFunction,
        query_dim: usize,
        hidden: usize,
        window_size: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        let global = GlobalAttention::new(
            store,
            &format!("{scope}/global"),
            function,
            query_dim,
            hidden,
            init,
        )?;
        let local = LocalAttention::new(
            store,
            &format!("{scope}/local"),
            function,
            query_dim,
            hidden,
            window_size,
            init,
        )?;
        let gate = Linear::register(
            store,
            &format!("{scope}/gate"),
            LinearConfig::new(query_dim, hidden),
            init,
        )?;
        let gate_vector = store.sample(&format!("{scope}/vb"), &[hidden], init)?;
        Ok(Self {
            global,
            local,
            gate,
            gate_vector,
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    /// Gate value `beta` per batch row, `[batch, 1]`.
    pub fn gate(&self, query: &Tensor) -> Result<Tensor, AttentionError> {
        let projected = self.policy.cast_for_matmul(&self.gate.forward(query, &self.policy)?)?;
        let vb = self.policy.cast_for_matmul(self.gate_vector.as_tensor())?;
        let energy = projected.tanh()?.broadcast_mul(&vb)?.sum_keepdim(1)?;
        Ok(sigmoid(&energy)?)
    }

    /// Runs both branches and the gate without blending them.
    pub fn attend_parts(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<HybridParts, AttentionError> {
        Ok(HybridParts {
            global: self.global.attend(query, memory)?,
            local: self.local.attend(query, memory)?,
            gate: self.gate(query)?,
        })
    }
}

fn blend(gate: &Tensor, global: &Tensor, local: &Tensor) -> Result<Tensor, AttentionError> {
    let gate = gate.to_dtype(global.dtype())?;
    let complement = gate.affine(-1.0, 1.0)?;
    let blended = global
        .broadcast_mul(&gate)?
        .add(&local.broadcast_mul(&complement)?)?;
    Ok(blended)
}

impl ContextAttention for HybridAttention {
    fn attend(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<AttentionOutput, AttentionError> {
        let parts = self.attend_parts(query, memory)?;
        let context = blend(&parts.gate, &parts.global.context, &parts.local.context)?;
        let weights = blend(&parts.gate, &parts.global.weights, &parts.local.weights)?;
        Ok(AttentionOutput {
            context,
            weights,
            window_centres: parts.local.window_centres,
            gate: Some(parts.gate),
        })
    }
}

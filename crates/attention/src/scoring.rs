//! Encoder projection and content scoring.
//!
//! [`EncoderProjection`] owns the parameters applied to the encoder states
//! once per decode call: the feature projection `W` (full hidden width,
//! reduced to one, or absent for `dot`) and, for the full-width additive
//! scorers, the weighting vector `v`. The result is an [`EncoderMemory`] that
//! every attention branch reads for the rest of the call.
//!
//! [`ContentScorer`] turns a decoder query into alignment scores
//! `[batch, source_len]`. Each attention branch owns its own scorer (and so
//! its own query projection) while sharing the memory's features and `v`.

use std::sync::Arc;

use candle_core::{DType, Tensor, Var};
use layers::{
    builtin, checks, Activation, Linear, LinearConfig, LinearInit, LinearLayer, ParameterStore,
    PrecisionPolicy,
};

use crate::core::{AttentionError, ContentFunction};

/// Parameters applied to the encoder states before the step loop.
#[derive(Debug, Clone)]
pub struct EncoderProjection {
    function: ContentFunction,
    hidden: usize,
    features: Option<Linear>,
    weight_vector: Option<Var>,
    policy: PrecisionPolicy,
}

impl EncoderProjection {
    /// Registers `scope/features` and, where the scorer needs it, `scope/v`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        function: ContentFunction,
        hidden: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        if hidden == 0 {
            return Err(AttentionError::config("hidden size must be non-zero"));
        }
        let features = if function.projects_encoder_states() {
            let config = LinearConfig::without_bias(hidden, function.feature_width(hidden));
            Some(Linear::register(
                store,
                &format!("{scope}/features"),
                config,
                init,
            )?)
        } else {
            None
        };
        let weight_vector = if function.uses_weight_vector() {
            Some(store.sample(&format!("{scope}/v"), &[hidden], init)?)
        } else {
            None
        };
        Ok(Self {
            function,
            hidden,
            features,
            weight_vector,
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    pub fn content_function(&self) -> ContentFunction {
        self.function
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Projects `encoder_states` `[batch, source_len, hidden]` into a reusable memory.
    pub fn project(&self, encoder_states: &Tensor) -> Result<EncoderMemory, AttentionError> {
        AttentionError::from_check(checks::expect_batch_seq_hidden(
            "encoder states",
            encoder_states,
            self.hidden,
        ))?;
        let (batch, source_len, _) = encoder_states.dims3()?;
        if batch == 0 || source_len == 0 {
            return Err(AttentionError::shape(
                "encoder states must have non-zero batch and source length",
            ));
        }

        let states = self.policy.cast_for_matmul(encoder_states)?;
        let features = match &self.features {
            Some(linear) => linear.forward(&states, &self.policy)?,
            None => states.clone(),
        };
        let weight_vector = self
            .weight_vector
            .as_ref()
            .map(|v| self.policy.cast_for_matmul(v.as_tensor()))
            .transpose()?;

        Ok(EncoderMemory {
            function: self.function,
            states,
            features,
            weight_vector,
            batch,
            source_len,
            hidden: self.hidden,
        })
    }
}

/// Encoder states plus their projected features, shared read-only by every step.
#[derive(Debug, Clone)]
pub struct EncoderMemory {
    function: ContentFunction,
    states: Tensor,
    features: Tensor,
    weight_vector: Option<Tensor>,
    batch: usize,
    source_len: usize,
    hidden: usize,
}

impl EncoderMemory {
    pub fn content_function(&self) -> ContentFunction {
        self.function
    }

    /// Encoder states `[batch, source_len, hidden]`.
    pub fn states(&self) -> &Tensor {
        &self.states
    }

    /// Projected features `[batch, source_len, feature_width]`.
    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// Weighting vector `v` for the full-width additive scorers.
    pub fn weight_vector(&self) -> Option<&Tensor> {
        self.weight_vector.as_ref()
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn feature_width(&self) -> usize {
        self.function.feature_width(self.hidden)
    }
}

/// Learned query side of a content function.
#[derive(Clone)]
pub struct ContentScorer {
    function: ContentFunction,
    query_dim: usize,
    query: Option<Linear>,
    energy: Option<Arc<dyn Activation>>,
    policy: PrecisionPolicy,
}

impl std::fmt::Debug for ContentScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentScorer")
            .field("function", &self.function)
            .field("query_dim", &self.query_dim)
            .field("projects_query", &self.query.is_some())
            .finish()
    }
}

impl ContentScorer {
    /// Registers `scope/query` for the additive family; bilinear forms own no parameters.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        function: ContentFunction,
        query_dim: usize,
        hidden: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        if function.requires_matching_query() && query_dim != hidden {
            return Err(AttentionError::config(format!(
                "{function} scoring needs query width {query_dim} to equal hidden size {hidden}"
            )));
        }
        let query = match function.query_width(hidden) {
            Some(width) => Some(Linear::register(
                store,
                &format!("{scope}/query"),
                LinearConfig::new(query_dim, width),
                init,
            )?),
            None => None,
        };
        Ok(Self {
            function,
            query_dim,
            query,
            energy: function.energy_activation().map(builtin),
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    /// Scorer whose query projection lives elsewhere; only [`Self::combine`] is usable.
    pub(crate) fn external_query(function: ContentFunction, query_dim: usize, policy: PrecisionPolicy) -> Self {
        Self {
            function,
            query_dim,
            query: None,
            energy: function.energy_activation().map(builtin),
            policy,
        }
    }

    pub fn content_function(&self) -> ContentFunction {
        self.function
    }

    /// Scores every source position for `query` `[batch, query_dim]`.
    pub fn score(&self, query: &Tensor, memory: &EncoderMemory) -> Result<Tensor, AttentionError> {
        AttentionError::from_check(checks::expect_batch_hidden(
            "content scorer query",
            query,
            self.query_dim,
        ))?;
        let projected = match &self.query {
            Some(linear) => linear.forward(query, &self.policy)?,
            None => query.clone(),
        };
        self.combine(&projected, memory)
    }

    /// Combines an already projected query `[batch, feature_width]` with the memory.
    pub fn combine(&self, projected: &Tensor, memory: &EncoderMemory) -> Result<Tensor, AttentionError> {
        let expected = [memory.batch(), memory.feature_width()];
        if projected.dims() != expected {
            return Err(AttentionError::shape(format!(
                "projected query expected {:?}, got {:?}",
                expected,
                projected.dims()
            )));
        }
        let query = self.policy.cast_for_matmul(projected)?.unsqueeze(1)?;
        let features = memory.features();

        let energies = match &self.energy {
            None => features.broadcast_mul(&query)?,
            Some(activation) => {
                let summed = features.broadcast_add(&query)?;
                let activated = activation.forward(&summed, &self.policy)?;
                match (self.function.uses_weight_vector(), memory.weight_vector()) {
                    (true, Some(v)) => activated.broadcast_mul(v)?,
                    (true, None) => {
                        return Err(AttentionError::config(format!(
                            "{} scoring requires a weighting vector in the encoder memory",
                            self.function
                        )))
                    }
                    (false, _) => activated,
                }
            }
        };
        Ok(energies.sum(2)?)
    }
}

/// Collapses `weights` `[batch, source_len]` against `states` `[batch, source_len, hidden]`.
pub fn weighted_sum(weights: &Tensor, states: &Tensor) -> Result<Tensor, AttentionError> {
    let (batch, source_len) = weights.dims2()?;
    let (state_batch, state_len, _) = states.dims3()?;
    if batch != state_batch || source_len != state_len {
        return Err(AttentionError::shape(format!(
            "weights {:?} do not align with states {:?}",
            weights.dims(),
            states.dims()
        )));
    }
    let dtype = match states.dtype() {
        DType::F64 => DType::F64,
        _ => DType::F32,
    };
    let weights = weights.to_dtype(dtype)?.unsqueeze(2)?;
    let states_work = states.to_dtype(dtype)?;
    let summed = weights.broadcast_mul(&states_work)?.sum(1)?;
    Ok(summed.to_dtype(states.dtype())?)
}

//! Global attention: a softmax over every source position.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use layers::{LinearInit, ParameterStore};

use crate::core::{AttentionError, AttentionOutput, ContentFunction, ContextAttention};
use crate::scoring::{weighted_sum, ContentScorer, EncoderMemory};

/// Attends over the whole encoder memory with one learned scorer.
#[derive(Debug, Clone)]
pub struct GlobalAttention {
    scorer: ContentScorer,
}

impl GlobalAttention {
    /// Registers the branch parameters under `scope`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        function: ContentFunction,
        query_dim: usize,
        hidden: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        let scorer = ContentScorer::new(store, scope, function, query_dim, hidden, init)?;
        Ok(Self { scorer })
    }

    pub fn scorer(&self) -> &ContentScorer {
        &self.scorer
    }

    /// Normalised alignment weights `[batch, source_len]`.
    pub fn weights(&self, query: &Tensor, memory: &EncoderMemory) -> Result<Tensor, AttentionError> {
        let scores = self.scorer.score(query, memory)?;
        Ok(softmax(&scores, D::Minus1)?)
    }
}

impl ContextAttention for GlobalAttention {
    fn attend(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<AttentionOutput, AttentionError> {
        let weights = self.weights(query, memory)?;
        let context = weighted_sum(&weights, memory.states())?;
        Ok(AttentionOutput {
            context,
            weights,
            window_centres: None,
            gate: None,
        })
    }
}

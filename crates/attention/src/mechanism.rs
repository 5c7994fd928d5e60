//! Attention strategy resolved once from a [`Config`].

use candle_core::Tensor;
use layers::{LinearInit, ParameterStore};

use crate::core::{AttentionError, AttentionOutput, AttentionType, Config, ContextAttention};
use crate::global::GlobalAttention;
use crate::hybrid::HybridAttention;
use crate::local::LocalAttention;
use crate::scoring::EncoderMemory;

/// One of the three encoder attention strategies.
#[derive(Debug, Clone)]
pub enum AttentionMechanism {
    Global(GlobalAttention),
    Local(LocalAttention),
    Hybrid(HybridAttention),
}

impl AttentionMechanism {
    /// Validates `config` and registers the chosen strategy's parameters under `scope`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        config: &Config,
        query_dim: usize,
        hidden: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let function = config.content_function;
        let mechanism = match config.attention_type {
            AttentionType::Global => Self::Global(GlobalAttention::new(
                store, scope, function, query_dim, hidden, init,
            )?),
            AttentionType::Local => Self::Local(LocalAttention::new(
                store,
                scope,
                function,
                query_dim,
                hidden,
                config.window_size,
                init,
            )?),
            AttentionType::Hybrid => Self::Hybrid(HybridAttention::new(
                store,
                scope,
                function,
                query_dim,
                hidden,
                config.window_size,
                init,
            )?),
        };
        Ok(mechanism)
    }

    pub fn attention_type(&self) -> AttentionType {
        match self {
            Self::Global(_) => AttentionType::Global,
            Self::Local(_) => AttentionType::Local,
            Self::Hybrid(_) => AttentionType::Hybrid,
        }
    }
}

impl ContextAttention for AttentionMechanism {
    fn attend(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<AttentionOutput, AttentionError> {
        match self {
            Self::Global(inner) => inner.attend(query, memory),
            Self::Local(inner) => inner.attend(query, memory),
            Self::Hybrid(inner) => inner.attend(query, memory),
        }
    }
}

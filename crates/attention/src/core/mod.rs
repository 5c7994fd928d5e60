//! Core traits and types shared across attention implementations.
//!
//! Queries are shaped `[batch, query_dim]`. Encoder memories hold the states
//! `[batch, source_len, hidden]` together with their projected features
//! `[batch, source_len, feature_width]`. Every implementation returns a context
//! vector shaped `[batch, hidden]` regardless of the attention type, plus the
//! per-position weights that produced it.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{AttentionType, Config, ContentFunction, DEFAULT_WINDOW_SIZE};
pub use errors::AttentionError;

use crate::scoring::EncoderMemory;

/// Result of one attention pass over the encoder memory.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Weighted summary of the encoder states, `[batch, hidden]`.
    pub context: Tensor,
    /// Effective weight of every source position, `[batch, source_len]`.
    pub weights: Tensor,
    /// Window centre per batch row when a local branch ran.
    pub window_centres: Option<Vec<f32>>,
    /// Hybrid gate per batch row, `[batch, 1]`.
    pub gate: Option<Tensor>,
}

/// Unified interface for encoder attention mechanisms.
///
/// * `query` is `[batch, query_dim]`, typically the current cell output.
/// * The returned context is always `[batch, hidden]`.
pub trait ContextAttention {
    fn attend(&self, query: &Tensor, memory: &EncoderMemory)
        -> Result<AttentionOutput, AttentionError>;
}

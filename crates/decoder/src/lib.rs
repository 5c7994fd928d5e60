//! Attention-augmented recurrent decoder.
//!
//! The crate ties a [`RecurrentCell`] to the encoder attention mechanisms of
//! the `attention` crate and runs the per-step loop: input preparation
//! (feedback, input feeding, optional input/context combination), the cell
//! step, encoder attention, optional self-attention over the decoder's own
//! outputs, and the `tanh` output projection.
//!
//! [`AttentionDecoder`] works on dense step inputs; [`EmbeddingAttentionDecoder`]
//! adds a symbol embedding table and argmax feedback on top. Both are built
//! from a [`DecoderConfig`] and register every parameter in a caller-owned
//! [`layers::ParameterStore`] before the first step.

pub mod cell;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod feedback;

pub use cell::{RecurrentCell, StackedGru};
pub use config::{DecoderConfig, InitConfig, OutputProjection, DEFAULT_SEED};
pub use decoder::{
    AttentionDecoder, DecodeOutput, DecodeSession, EmbeddingAttentionDecoder, Phase,
    PriorHistory, DEFAULT_SCOPE,
};
pub use errors::DecoderError;
pub use feedback::{ArgmaxEmbed, FeedbackPolicy};

//! Encoder attention and decoder-output self-attention for recurrent decoders.
//!
//! Encoder states are laid out `[batch, source_len, hidden]` and decoder
//! queries `[batch, query_dim]`. An [`EncoderProjection`] turns the states
//! into an [`EncoderMemory`] once per decode call; the per-step mechanisms
//! then score the query against that memory and return a context vector
//! `[batch, hidden]` together with the weights that produced it.
//!
//! Three strategies are provided:
//!
//! * [`GlobalAttention`] normalises the scores over every source position.
//! * [`LocalAttention`] predicts a window centre, masks and tapers the
//!   scores around it.
//! * [`HybridAttention`] blends the two with a learned per-row gate.
//!
//! [`AttentionMechanism`] picks one of them from a [`Config`] at setup time.
//! [`DecoderSelfAttention`] attends over the decoder's own output history in
//! full or incremental mode.
//!
//! Every constructor registers its parameters eagerly in a
//! [`layers::ParameterStore`] under a caller-supplied scope.

pub mod core;
pub mod global;
pub mod hybrid;
pub mod local;
pub mod masks;
pub mod mechanism;
pub mod scoring;
pub mod self_attention;

pub use crate::core::{
    AttentionError, AttentionOutput, AttentionType, Config, ContentFunction, ContextAttention,
    DEFAULT_WINDOW_SIZE,
};
pub use global::GlobalAttention;
pub use hybrid::{HybridAttention, HybridParts};
pub use local::LocalAttention;
pub use mechanism::AttentionMechanism;
pub use scoring::{weighted_sum, ContentScorer, EncoderMemory, EncoderProjection};
pub use self_attention::{DecoderSelfAttention, OutputHistory, SelfAttentionOutput};

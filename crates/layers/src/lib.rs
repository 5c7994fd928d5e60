//! Building blocks shared by the attention decoder crates.
//!
//! The crate hosts the multi-input affine projection used throughout the
//! decoder, the activation catalogue, lightweight shape checks, the precision
//! policy that decides which dtype projections run in, and the
//! [`ParameterStore`](params::ParameterStore) that owns every trainable
//! variable for the lifetime of a decoder.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod params;

pub use activations::{builtin, Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use params::ParameterStore;

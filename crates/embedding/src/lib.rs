//! Embedding crate
//!
//! The token module owns the decoder's symbol embedding table, registered in
//! a [`layers::ParameterStore`], and the argmax-and-embed lookup used to feed
//! a decoder its own previous prediction.

pub mod token;

pub use token::*;

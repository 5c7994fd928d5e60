//! Policies that turn the previous step's output into the next step's input.
//!
//! Whatever a policy returns is detached by the step loop before use, so no
//! gradient flows back through the fed-back value.

use candle_core::Tensor;
use embedding::TokenEmbedding;

use crate::config::OutputProjection;
use crate::errors::DecoderError;

pub trait FeedbackPolicy {
    /// Builds the input for `step` from the output emitted at `step - 1`.
    fn next_input(&self, previous_output: &Tensor, step: usize) -> Result<Tensor, DecoderError>;
}

impl<F> FeedbackPolicy for F
where
    F: Fn(&Tensor, usize) -> Result<Tensor, DecoderError>,
{
    fn next_input(&self, previous_output: &Tensor, step: usize) -> Result<Tensor, DecoderError> {
        self(previous_output, step)
    }
}

/// Projects the previous output to logits, takes the argmax symbol and embeds it.
#[derive(Debug, Clone, Copy)]
pub struct ArgmaxEmbed<'a> {
    embedding: &'a TokenEmbedding,
    projection: Option<&'a OutputProjection>,
}

impl<'a> ArgmaxEmbed<'a> {
    pub fn new(embedding: &'a TokenEmbedding, projection: Option<&'a OutputProjection>) -> Self {
        Self {
            embedding,
            projection,
        }
    }
}

impl FeedbackPolicy for ArgmaxEmbed<'_> {
    fn next_input(&self, previous_output: &Tensor, _step: usize) -> Result<Tensor, DecoderError> {
        let logits = match self.projection {
            Some(projection) => projection.apply(previous_output)?,
            None => previous_output.clone(),
        };
        Ok(self.embedding.argmax_embed(&logits)?)
    }
}

//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// A component was assembled with settings it cannot honour.
    #[error("invalid attention configuration: {message}")]
    InvalidConfig { message: String },
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Re-labels a failed shape check from the `layers` helpers.
    pub(crate) fn from_check(result: candle_core::Result<()>) -> Result<(), Self> {
        result.map_err(|err| Self::shape(err.to_string()))
    }
}

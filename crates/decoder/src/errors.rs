//! Error type for decoder assembly and the step loop.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    /// Every configuration problem found, reported together.
    #[error("invalid decoder configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("failed to parse decoder config: {0}")]
    ConfigFormat(String),
    #[error("failed to read decoder config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid tensor shape for {context}")]
    Shape { context: String },
    /// Output history missing, inconsistent, or used without self-attention.
    #[error("decoder history error: {message}")]
    History { message: String },
    /// Step requested from a session that is not accepting steps.
    #[error("decode session error: {message}")]
    Session { message: String },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl DecoderError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn shape(context: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
        }
    }

    pub fn history(message: impl Into<String>) -> Self {
        Self::History {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for DecoderError {
    fn from(value: toml::de::Error) -> Self {
        DecoderError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for DecoderError {
    fn from(value: serde_json::Error) -> Self {
        DecoderError::ConfigFormat(value.to_string())
    }
}

//! Configuration options shared by all attention implementations.
//!
//! [`AttentionType`] and [`ContentFunction`] are closed sets resolved once when
//! a decoder is assembled; the per-step code never re-inspects strings. Both
//! accept the historical tag names as serde aliases so existing experiment
//! configurations keep loading.

use std::{fmt, str::FromStr};

use layers::ActivationKind;
use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Window half-width used by local attention when none is configured.
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// How the context vector is gathered from the encoder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Softmax over every source position.
    Global,
    /// Truncated-Gaussian window around a predicted centre.
    Local,
    /// Learned gate blending the global and local contexts.
    Hybrid,
}

impl AttentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionType::Global => "global",
            AttentionType::Local => "local",
            AttentionType::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for AttentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionType {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "global" => Ok(AttentionType::Global),
            "local" => Ok(AttentionType::Local),
            "hybrid" => Ok(AttentionType::Hybrid),
            other => Err(AttentionError::config(format!(
                "unsupported attention type '{other}'"
            ))),
        }
    }
}

/// Alignment score between a decoder query and the projected encoder states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFunction {
    /// `sum(q * h_s)` over raw encoder states.
    #[serde(alias = "luong_dot")]
    Dot,
    /// `sum(q * W h_s)`.
    #[serde(alias = "luong_general")]
    General,
    /// `sum(v * tanh(W h_s + U q))`.
    #[default]
    #[serde(alias = "vinyals_kayser")]
    Additive,
    /// `sum(tanh(W h_s + U q))` with both projections reduced to width one.
    #[serde(alias = "modified_vinyals_kayser")]
    AdditiveReduced,
    /// `sum(v * relu(W h_s + U q))`.
    #[serde(alias = "modified_vinyals_kayser_relu")]
    AdditiveRelu,
    /// Reduced additive scoring queried with the previous step's cell output.
    #[serde(alias = "modified_bahdanau")]
    AdditiveBahdanau,
}

impl ContentFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentFunction::Dot => "dot",
            ContentFunction::General => "general",
            ContentFunction::Additive => "additive",
            ContentFunction::AdditiveReduced => "additive_reduced",
            ContentFunction::AdditiveRelu => "additive_relu",
            ContentFunction::AdditiveBahdanau => "additive_bahdanau",
        }
    }

    /// Width of the projected encoder features the scorer works against.
    pub fn feature_width(&self, hidden: usize) -> usize {
        match self {
            ContentFunction::AdditiveReduced | ContentFunction::AdditiveBahdanau => 1,
            _ => hidden,
        }
    }

    /// Whether encoder states go through a learned projection before scoring.
    pub fn projects_encoder_states(&self) -> bool {
        !matches!(self, ContentFunction::Dot)
    }

    /// Whether the post-activation energies are weighted by a learned vector `v`.
    pub fn uses_weight_vector(&self) -> bool {
        matches!(self, ContentFunction::Additive | ContentFunction::AdditiveRelu)
    }

    /// Output width of the learned query projection, if the scorer has one.
    pub fn query_width(&self, hidden: usize) -> Option<usize> {
        match self {
            ContentFunction::Dot | ContentFunction::General => None,
            other => Some(other.feature_width(hidden)),
        }
    }

    /// Non-linearity applied to `features + query`; `None` for the bilinear forms.
    pub fn energy_activation(&self) -> Option<ActivationKind> {
        match self {
            ContentFunction::Dot | ContentFunction::General => None,
            ContentFunction::AdditiveRelu => Some(ActivationKind::Relu),
            _ => Some(ActivationKind::Tanh),
        }
    }

    /// Whether the raw query must already share the encoder hidden width.
    pub fn requires_matching_query(&self) -> bool {
        matches!(self, ContentFunction::Dot | ContentFunction::General)
    }

    /// Whether the scorer is queried with the previous cell output instead of the current one.
    pub fn queries_previous_output(&self) -> bool {
        matches!(self, ContentFunction::AdditiveBahdanau)
    }
}

impl fmt::Display for ContentFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentFunction {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "dot" | "luong_dot" => Ok(ContentFunction::Dot),
            "general" | "luong_general" => Ok(ContentFunction::General),
            "additive" | "vinyals_kayser" => Ok(ContentFunction::Additive),
            "additive_reduced" | "modified_vinyals_kayser" => Ok(ContentFunction::AdditiveReduced),
            "additive_relu" | "modified_vinyals_kayser_relu" => Ok(ContentFunction::AdditiveRelu),
            "additive_bahdanau" | "modified_bahdanau" => Ok(ContentFunction::AdditiveBahdanau),
            other => Err(AttentionError::config(format!(
                "unsupported content function '{other}'"
            ))),
        }
    }
}

/// Configuration driving attention behaviour for one decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub attention_type: AttentionType,
    pub content_function: ContentFunction,
    /// Half-width of the local attention window, in source positions.
    pub window_size: usize,
}

impl Config {
    pub fn new(attention_type: AttentionType, content_function: ContentFunction) -> Self {
        Self {
            attention_type,
            content_function,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.window_size == 0
            && matches!(self.attention_type, AttentionType::Local | AttentionType::Hybrid)
        {
            return Err(AttentionError::config(
                "local attention requires window_size > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_tags_parse() {
        assert_eq!(
            "vinyals_kayser".parse::<ContentFunction>().unwrap(),
            ContentFunction::Additive
        );
        assert_eq!(
            "modified-bahdanau".parse::<ContentFunction>().unwrap(),
            ContentFunction::AdditiveBahdanau
        );
        assert!("cosine".parse::<ContentFunction>().is_err());
        assert_eq!("Hybrid".parse::<AttentionType>().unwrap(), AttentionType::Hybrid);
    }

    #[test]
    fn serde_accepts_aliases_and_writes_canonical_names() -> serde_json::Result<()> {
        let parsed: ContentFunction = serde_json::from_str("\"luong_general\"")?;
        assert_eq!(parsed, ContentFunction::General);
        let parsed: ContentFunction = serde_json::from_str("\"additive_relu\"")?;
        assert_eq!(parsed, ContentFunction::AdditiveRelu);
        assert_eq!(
            serde_json::to_string(&ContentFunction::AdditiveBahdanau)?,
            "\"additive_bahdanau\""
        );
        assert_eq!(serde_json::to_string(&AttentionType::Local)?, "\"local\"");
        Ok(())
    }

    #[test]
    fn only_full_width_additive_variants_use_v() {
        let with_v: Vec<_> = [
            ContentFunction::Dot,
            ContentFunction::General,
            ContentFunction::Additive,
            ContentFunction::AdditiveReduced,
            ContentFunction::AdditiveRelu,
            ContentFunction::AdditiveBahdanau,
        ]
        .into_iter()
        .filter(ContentFunction::uses_weight_vector)
        .collect();
        assert_eq!(
            with_v,
            vec![ContentFunction::Additive, ContentFunction::AdditiveRelu]
        );
        assert_eq!(ContentFunction::AdditiveReduced.feature_width(8), 1);
        assert_eq!(ContentFunction::Dot.query_width(8), None);
    }

    #[test]
    fn zero_window_rejected_for_local_variants() {
        let mut config = Config::new(AttentionType::Local, ContentFunction::Additive);
        config.window_size = 0;
        assert!(config.validate().is_err());
        config.attention_type = AttentionType::Global;
        assert!(config.validate().is_ok());
    }
}

//! Decoder configuration, loadable from TOML or JSON.

use std::{fs, path::Path};

use attention::{AttentionType, Config as AttentionConfig, ContentFunction, DEFAULT_WINDOW_SIZE};
use candle_core::Tensor;
use layers::LinearInit;
use serde::{Deserialize, Serialize};

use crate::errors::DecoderError;

/// Seed used for parameter sampling when none is configured.
pub const DEFAULT_SEED: u64 = 1234;

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

/// Uniform initialiser applied to every decoder parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub low: f64,
    pub high: f64,
    pub seed: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            low: -0.1,
            high: 0.1,
            seed: DEFAULT_SEED,
        }
    }
}

impl InitConfig {
    pub fn linear_init(&self) -> LinearInit {
        LinearInit::Uniform {
            low: self.low,
            high: self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Attention size; must equal the encoder state width.
    pub hidden_size: usize,
    pub num_symbols: usize,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Width of each decoder step input. Defaults to half the cell input
    /// width under input feeding and the full cell input width otherwise.
    #[serde(default)]
    pub input_size: Option<usize>,
    /// Width of each emitted output. Defaults to the cell output width.
    #[serde(default)]
    pub output_size: Option<usize>,
    #[serde(default)]
    pub input_feeding: bool,
    /// Feed the argmax of the previous output back in (embedding front-end).
    #[serde(default)]
    pub feed_previous: bool,
    /// Attend over previously emitted cell outputs before the output projection.
    #[serde(default)]
    pub output_attention: bool,
    /// Fuse the step input and previous context through `tanh(Linear(..))`.
    #[serde(default)]
    pub combine_input_attention: bool,
    #[serde(default)]
    pub attention_type: Option<AttentionType>,
    #[serde(default)]
    pub content_function: ContentFunction,
    #[serde(default)]
    pub dropout: Option<f64>,
    #[serde(default)]
    pub init: InitConfig,
}

impl DecoderConfig {
    pub fn new(hidden_size: usize, num_symbols: usize, attention_type: AttentionType) -> Self {
        Self {
            hidden_size,
            num_symbols,
            window_size: DEFAULT_WINDOW_SIZE,
            input_size: None,
            output_size: None,
            input_feeding: false,
            feed_previous: false,
            output_attention: false,
            combine_input_attention: false,
            attention_type: Some(attention_type),
            content_function: ContentFunction::default(),
            dropout: None,
            init: InitConfig::default(),
        }
    }

    /// Loads a configuration, picking the format from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecoderError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: DecoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, DecoderError> {
        let config: DecoderConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, DecoderError> {
        let config: DecoderConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that does not depend on the recurrent cell.
    pub fn validate(&self) -> Result<(), DecoderError> {
        let errors = self.collect_errors();
        if !errors.is_empty() {
            return Err(DecoderError::validation(errors));
        }
        Ok(())
    }

    /// Checks the configuration together with the cell widths.
    pub fn validate_for_cell(
        &self,
        cell_input_size: usize,
        cell_output_size: usize,
    ) -> Result<(), DecoderError> {
        let mut errors = self.collect_errors();
        errors.extend(self.cell_errors(cell_input_size, cell_output_size));
        if !errors.is_empty() {
            return Err(DecoderError::validation(errors));
        }
        Ok(())
    }

    /// Cell checks plus the projection and argmax feedback widths of the
    /// embedding front-end.
    pub fn validate_for_embedding(
        &self,
        cell_input_size: usize,
        cell_output_size: usize,
        projection: Option<&OutputProjection>,
    ) -> Result<(), DecoderError> {
        let mut errors = self.collect_errors();
        errors.extend(self.cell_errors(cell_input_size, cell_output_size));
        errors.extend(self.feedback_errors(cell_output_size, projection));
        if !errors.is_empty() {
            return Err(DecoderError::validation(errors));
        }
        Ok(())
    }

    fn cell_errors(&self, cell_input_size: usize, cell_output_size: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hidden_size > 0 {
            let needs_matching_query = self.content_function.requires_matching_query();
            if needs_matching_query && cell_output_size != self.hidden_size {
                errors.push(format!(
                    "content_function {} needs cell output size {} to equal hidden_size {}",
                    self.content_function, cell_output_size, self.hidden_size
                ));
            }
            if self.output_attention && cell_output_size != self.hidden_size {
                errors.push(format!(
                    "output_attention needs cell output size {} to equal hidden_size {}",
                    cell_output_size, self.hidden_size
                ));
            }
        }

        let input_size = self.resolved_input_size(cell_input_size);
        if input_size == 0 {
            errors.push("decoder step input width must be greater than 0".to_string());
        }
        if !self.combine_input_attention {
            let fed = input_size + if self.input_feeding { self.hidden_size } else { 0 };
            if fed != cell_input_size {
                errors.push(format!(
                    "cell input size {} does not match step input width {} (input_feeding = {})",
                    cell_input_size, fed, self.input_feeding
                ));
            }
        }
        errors
    }

    /// The argmax feedback reads logits from the projected output, or from
    /// the raw output when no projection is given.
    fn feedback_errors(
        &self,
        cell_output_size: usize,
        projection: Option<&OutputProjection>,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        let output_size = self.resolved_output_size(cell_output_size);
        match projection {
            Some(projection) => {
                errors.extend(projection.check(cell_output_size, self.num_symbols));
                if self.feed_previous && output_size != cell_output_size {
                    errors.push(
                        "feed_previous with an output projection needs output_size to equal the cell output size"
                            .to_string(),
                    );
                }
            }
            None if self.feed_previous && output_size != self.num_symbols => errors.push(
                "feed_previous without an output projection needs output_size to equal num_symbols"
                    .to_string(),
            ),
            None => {}
        }
        errors
    }

    fn collect_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.num_symbols == 0 {
            errors.push("num_symbols must be greater than 0".to_string());
        }
        if let Some(0) = self.output_size {
            errors.push("output_size must be greater than 0".to_string());
        }
        if let Some(0) = self.input_size {
            errors.push("input_size must be greater than 0".to_string());
        }
        match self.attention_type {
            None => errors.push("attention_type must be set (global, local or hybrid)".to_string()),
            Some(AttentionType::Local) | Some(AttentionType::Hybrid) if self.window_size == 0 => {
                errors.push("window_size must be greater than 0 for local attention".to_string())
            }
            Some(_) => {}
        }
        if let Some(dropout) = self.dropout {
            if !(0.0..1.0).contains(&dropout) {
                errors.push("dropout must be in [0, 1)".to_string());
            }
        }
        if !(self.init.low < self.init.high) {
            errors.push("init.low must be smaller than init.high".to_string());
        }

        errors
    }

    /// Attention settings for the configured strategy.
    pub fn attention_config(&self) -> Result<AttentionConfig, DecoderError> {
        let attention_type = self.attention_type.ok_or_else(|| {
            DecoderError::validation(vec![
                "attention_type must be set (global, local or hybrid)".to_string()
            ])
        })?;
        let mut config = AttentionConfig::new(attention_type, self.content_function);
        config.window_size = self.window_size;
        Ok(config)
    }

    pub fn resolved_input_size(&self, cell_input_size: usize) -> usize {
        self.input_size.unwrap_or(if self.input_feeding {
            cell_input_size / 2
        } else {
            cell_input_size
        })
    }

    pub fn resolved_output_size(&self, cell_output_size: usize) -> usize {
        self.output_size.unwrap_or(cell_output_size)
    }
}

/// Externally owned projection from decoder outputs to symbol logits.
#[derive(Debug, Clone)]
pub struct OutputProjection {
    /// `[cell_output_size, num_symbols]`.
    pub weight: Tensor,
    /// `[num_symbols]`.
    pub bias: Tensor,
}

impl OutputProjection {
    pub fn new(weight: Tensor, bias: Tensor) -> Self {
        Self { weight, bias }
    }

    /// Shape problems against the expected widths, empty when the projection fits.
    pub fn check(&self, cell_output_size: usize, num_symbols: usize) -> Vec<String> {
        let mut errors = Vec::new();
        if self.weight.dims() != [cell_output_size, num_symbols] {
            errors.push(format!(
                "output projection weight expected [{}, {}], got {:?}",
                cell_output_size,
                num_symbols,
                self.weight.dims()
            ));
        }
        if self.bias.dims() != [num_symbols] {
            errors.push(format!(
                "output projection bias expected [{}], got {:?}",
                num_symbols,
                self.bias.dims()
            ));
        }
        errors
    }

    /// `x W + b` for `x` shaped `[batch, cell_output_size]`.
    pub fn apply(&self, output: &Tensor) -> Result<Tensor, DecoderError> {
        let weight = self.weight.to_dtype(output.dtype())?;
        let bias = self.bias.to_dtype(output.dtype())?;
        Ok(output.matmul(&weight)?.broadcast_add(&bias)?)
    }
}

//! Linear and affine projection helpers.
//!
//! A [`Linear`] maps inputs shaped `(batch, in_dim)` or `(batch, seq, in_dim)`
//! to the same leading layout with `out_dim` features. The decoder mostly
//! projects several tensors at once (`[cell_output, context]`,
//! `[query, query]`), so [`Linear::forward_concat`] concatenates its inputs
//! along the last axis before the affine map. Fused variants pack
//! `num_projections * output_dim` features; [`Linear::shard`] splits them back
//! apart. Weights and activations are cast to [`PrecisionPolicy::compute`] for
//! the matmul and the result is returned in the storage dtype.

use candle_core::{Error, Result, Tensor, Var};
use rand::{distributions::Uniform, rngs::StdRng, Rng};

use crate::{checks, dtypes::PrecisionPolicy, params::ParameterStore};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension (sum of all concatenated inputs).
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Same as [`LinearConfig::new`] but without a bias term.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }

    /// Indicates whether outputs are packed for multi-way projections.
    pub fn is_fused(&self) -> bool {
        self.fused_projections > 1
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Uniform samples in `[low, high)`.
    Uniform { low: f64, high: f64 },
}

impl Default for LinearInit {
    fn default() -> Self {
        Self::Uniform {
            low: -0.1,
            high: 0.1,
        }
    }
}

impl LinearInit {
    /// Draws `count` values for a parameter.
    pub(crate) fn sample(&self, count: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
        let LinearInit::Uniform { low, high } = *self;
        if !(low < high) || !low.is_finite() || !high.is_finite() {
            return Err(Error::Msg(format!(
                "initialiser bounds must satisfy low < high, got [{low}, {high})"
            )));
        }
        let dist = Uniform::new(low, high);
        Ok((0..count).map(|_| rng.sample(dist) as f32).collect())
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Var, bias: Option<Var>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref().map(|b| b.as_tensor()))?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Registers `name/weight` (and `name/bias`) in `store` and builds the layer.
    ///
    /// Biases start at zero; weights follow `init`.
    pub fn register(
        store: &mut ParameterStore,
        name: &str,
        config: LinearConfig,
        init: &LinearInit,
    ) -> Result<Self> {
        if config.input_dim == 0 || config.total_output_dim() == 0 {
            return Err(Error::Msg(format!(
                "{name}: linear dimensions must be non-zero, got {} -> {}",
                config.input_dim,
                config.total_output_dim()
            )));
        }
        let weight = store.sample(
            &format!("{name}/weight"),
            &[config.total_output_dim(), config.input_dim],
            init,
        )?;
        let bias = if config.bias {
            Some(store.zeros(&format!("{name}/bias"), &[config.total_output_dim()])?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the underlying weight tensor shaped `(out, in)`.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(|bias| bias.as_tensor())
    }

    /// Concatenates `inputs` along the last axis and applies the projection.
    pub fn forward_concat(&self, inputs: &[&Tensor], policy: &PrecisionPolicy) -> Result<Tensor> {
        match inputs {
            [] => Err(Error::Msg("linear requires at least one input".into())),
            [single] => self.forward(single, policy),
            many => {
                let last = many[0].rank().saturating_sub(1);
                let cast = many
                    .iter()
                    .map(|t| policy.cast_for_matmul(t))
                    .collect::<Result<Vec<_>>>()?;
                let joined = Tensor::cat(&cast, last)?;
                self.forward(&joined, policy)
            }
        }
    }

    /// Extracts projection shard `index` from a fused output.
    pub fn shard(&self, output: &Tensor, index: usize) -> Result<Tensor> {
        if index >= self.config.fused_projections {
            return Err(Error::Msg(format!(
                "shard index {index} out of range for {} fused projections",
                self.config.fused_projections
            )));
        }
        let last = output.rank().saturating_sub(1);
        output.narrow(last, index * self.config.output_dim, self.config.output_dim)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::ensure_float_dtype("linear.weight", weight.dtype())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::ensure_float_dtype("linear.bias", tensor.dtype())
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, hidden_dim] => {
                if *hidden_dim != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "expected last dim {} but received {}",
                        self.config.input_dim, hidden_dim
                    )))
                } else if *batch == 0 || *seq == 0 {
                    Err(Error::Msg("batch/seq dimensions must be non-zero".into()))
                } else {
                    Ok(())
                }
            }
            [_, hidden_dim] => {
                if *hidden_dim != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "expected last dim {} but received {}",
                        self.config.input_dim, hidden_dim
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Err(Error::Msg(
                "linear expects input shaped [B, T, H_in] or [B, H_in]".into(),
            )),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;

        let mut output = match input.dims() {
            [batch, seq, _] => {
                let (batch, seq) = (*batch, *seq);
                let flat = input.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, seq, self.config.total_output_dim()))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

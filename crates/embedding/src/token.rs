//! Symbol embedding table and the argmax feedback helper built on it.

use candle_core::{bail, DType, Error, Result, Tensor, Var, D};
use layers::{LinearInit, ParameterStore, PrecisionPolicy};

/// Shape of a symbol embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEmbeddingConfig {
    /// Number of distinct symbols.
    pub vocab_size: usize,
    /// Width of each embedding vector.
    pub hidden_dim: usize,
}

impl TokenEmbeddingConfig {
    pub fn new(vocab_size: usize, hidden_dim: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim,
        }
    }
}

/// Learnable `[vocab_size, hidden_dim]` lookup table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    /// Registers `scope/embedding` in `store`, sampled from `init`.
    pub fn register(
        store: &mut ParameterStore,
        scope: &str,
        config: TokenEmbeddingConfig,
        init: &LinearInit,
    ) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        let weight = store.sample(
            &format!("{scope}/embedding"),
            &[config.vocab_size, config.hidden_dim],
            init,
        )?;
        Ok(Self {
            config,
            weight,
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// The `[vocab_size, hidden_dim]` table.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Looks up embeddings for integer ids of any rank.
    ///
    /// `[batch]` ids produce `[batch, hidden_dim]`, `[batch, seq]` ids produce
    /// `[batch, seq, hidden_dim]`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.validate_token_ids(token_ids)?;
        let dims = token_ids.dims().to_vec();

        let flat = token_ids.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        let mut output_dims = dims;
        output_dims.push(self.config.hidden_dim);
        let output = gathered.reshape(output_dims)?;
        self.policy.cast_to_storage(&output)
    }

    /// Embeds the argmax symbol of `logits` `[batch, vocab_size]`, detached from the graph.
    pub fn argmax_embed(&self, logits: &Tensor) -> Result<Tensor> {
        match logits.dims() {
            [_, vocab] if *vocab == self.config.vocab_size => {}
            dims => {
                return Err(Error::Msg(format!(
                    "argmax_embed expects [batch, {}] logits, got {:?}",
                    self.config.vocab_size, dims
                )))
            }
        }
        let symbols = logits.detach().argmax(D::Minus1)?;
        Ok(self.forward(&symbols)?.detach())
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<()> {
        let dims = token_ids.dims();
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(Error::Msg(format!(
                "token_ids must have non-zero dimensions, got {:?}",
                dims
            )));
        }
        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )));
        }
        Ok(())
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let ids = flat_ids.to_dtype(DType::I64)?;
        let min_id = ids.min(0)?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {min_id}"
            )));
        }
        let max_id = ids.max(0)?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            return Err(Error::Msg(format!(
                "token id {max_id} exceeds vocab size {vocab}"
            )));
        }
        Ok(())
    }
}

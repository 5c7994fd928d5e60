//! Attention over the decoder's own output history.
//!
//! The history is the ordered list of cell outputs emitted so far, each
//! `[batch, hidden]`. Scoring uses its own projection and weighting vector:
//! `s_t = sum(v * tanh(W o_t))`, normalised with a softmax over the steps.
//!
//! Two entry points share the same parameters. [`DecoderSelfAttention::attend_full`]
//! reads the step count from the stacked tensor's shape and is what the step
//! loop uses when it owns the history. [`DecoderSelfAttention::attend_incremental`]
//! takes the step count from the caller, for inference where the stacked
//! history is threaded through successive calls and grows by one step each time.

use candle_core::{Tensor, Var, D};
use candle_nn::ops::softmax;
use layers::{Linear, LinearConfig, LinearInit, LinearLayer, ParameterStore, PrecisionPolicy};

use crate::core::AttentionError;
use crate::scoring::weighted_sum;

/// Append-only buffer of decoder outputs, each `[batch, hidden]`.
#[derive(Debug, Clone, Default)]
pub struct OutputHistory {
    entries: Vec<Tensor>,
}

impl OutputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits a stacked history `[batch, steps, hidden]` into per-step entries.
    pub fn from_stacked(stacked: &Tensor) -> Result<Self, AttentionError> {
        let (_, steps, _) = match stacked.dims() {
            [b, t, h] => (*b, *t, *h),
            dims => {
                return Err(AttentionError::shape(format!(
                    "stacked history must be [batch, steps, hidden], got {:?}",
                    dims
                )))
            }
        };
        let entries = (0..steps)
            .map(|step| stacked.narrow(1, step, 1)?.squeeze(1))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn push(&mut self, output: Tensor) {
        self.entries.push(output);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&Tensor> {
        self.entries.get(step)
    }

    /// Most recent output.
    pub fn last(&self) -> Option<&Tensor> {
        self.entries.last()
    }

    /// Output emitted one step before the most recent one.
    pub fn previous(&self) -> Option<&Tensor> {
        self.entries
            .len()
            .checked_sub(2)
            .and_then(|idx| self.entries.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.iter()
    }

    /// Stacks the history into `[batch, steps, hidden]`.
    pub fn stacked(&self) -> Result<Tensor, AttentionError> {
        if self.entries.is_empty() {
            return Err(AttentionError::shape("cannot stack an empty output history"));
        }
        Ok(Tensor::stack(&self.entries, 1)?)
    }
}

#[derive(Debug, Clone)]
pub struct SelfAttentionOutput {
    /// `[batch, hidden]`.
    pub context: Tensor,
    /// `[batch, steps]`, sums to one per row.
    pub weights: Tensor,
}

/// Scorer over decoder outputs with parameters `W` (no bias) and `v`.
#[derive(Debug, Clone)]
pub struct DecoderSelfAttention {
    hidden: usize,
    features: Linear,
    weight_vector: Var,
    policy: PrecisionPolicy,
}

impl DecoderSelfAttention {
    /// Registers `scope/features` and `scope/v`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        hidden: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        if hidden == 0 {
            return Err(AttentionError::config("hidden size must be non-zero"));
        }
        let features = Linear::register(
            store,
            &format!("{scope}/features"),
            LinearConfig::without_bias(hidden, hidden),
            init,
        )?;
        let weight_vector = store.sample(&format!("{scope}/v"), &[hidden], init)?;
        Ok(Self {
            hidden,
            features,
            weight_vector,
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
        })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Attends over every entry of `history`.
    pub fn attend(&self, history: &OutputHistory) -> Result<SelfAttentionOutput, AttentionError> {
        self.attend_full(&history.stacked()?)
    }

    /// Full mode: the step count is the stacked tensor's second dimension.
    pub fn attend_full(&self, stacked: &Tensor) -> Result<SelfAttentionOutput, AttentionError> {
        let steps = self.validate(stacked)?;
        self.attend_steps(stacked, steps)
    }

    /// Incremental mode: `steps` is supplied by the caller and must match the history.
    pub fn attend_incremental(
        &self,
        stacked: &Tensor,
        steps: usize,
    ) -> Result<SelfAttentionOutput, AttentionError> {
        let available = self.validate(stacked)?;
        if steps != available {
            return Err(AttentionError::shape(format!(
                "incremental self-attention expected {steps} steps, history holds {available}"
            )));
        }
        self.attend_steps(stacked, steps)
    }

    fn validate(&self, stacked: &Tensor) -> Result<usize, AttentionError> {
        match stacked.dims() {
            [batch, steps, hidden] if *hidden == self.hidden && *batch > 0 && *steps > 0 => {
                Ok(*steps)
            }
            dims => Err(AttentionError::shape(format!(
                "decoder history expected [batch, steps > 0, {}], got {:?}",
                self.hidden, dims
            ))),
        }
    }

    fn attend_steps(
        &self,
        stacked: &Tensor,
        steps: usize,
    ) -> Result<SelfAttentionOutput, AttentionError> {
        let batch = stacked.dim(0)?;
        let projected = self.features.forward(stacked, &self.policy)?;
        let projected = self.policy.cast_for_matmul(&projected)?;
        let v = self.policy.cast_for_matmul(self.weight_vector.as_tensor())?;
        let scores = projected.tanh()?.broadcast_mul(&v)?.sum(2)?;
        let weights = softmax(&scores, D::Minus1)?.reshape((batch, steps))?;
        let context = weighted_sum(&weights, stacked)?;
        Ok(SelfAttentionOutput { context, weights })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn history_tracks_previous_entry() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut history = OutputHistory::new();
        assert!(history.previous().is_none());
        history.push(Tensor::zeros((2, 3), DType::F32, &device)?);
        assert!(history.previous().is_none());
        history.push(Tensor::ones((2, 3), DType::F32, &device)?);
        let previous = history.previous().expect("two entries");
        assert_eq!(previous.sum_all()?.to_vec0::<f32>()?, 0.0);
        assert_eq!(history.stacked()?.dims(), &[2, 2, 3]);

        let rebuilt = OutputHistory::from_stacked(&history.stacked()?)?;
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.last().map(|t| t.dims().to_vec()), Some(vec![2, 3]));
        Ok(())
    }

    #[test]
    fn weights_sum_to_one_over_steps() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut store = ParameterStore::new(&device, DType::F32, 1234);
        let attention = DecoderSelfAttention::new(&mut store, "self", 4, &LinearInit::default())?;
        let stacked = Tensor::randn(0f32, 1.0, (3, 5, 4), &device)?;
        let output = attention.attend_full(&stacked)?;
        assert_eq!(output.context.dims(), &[3, 4]);
        for row in output.weights.to_vec2::<f32>()? {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn incremental_step_count_must_match() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut store = ParameterStore::new(&device, DType::F32, 1234);
        let attention = DecoderSelfAttention::new(&mut store, "self", 2, &LinearInit::default())?;
        let stacked = Tensor::randn(0f32, 1.0, (1, 3, 2), &device)?;
        assert!(attention.attend_incremental(&stacked, 3).is_ok());
        assert!(matches!(
            attention.attend_incremental(&stacked, 4),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn single_step_history_returns_that_step() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut store = ParameterStore::new(&device, DType::F32, 7);
        let attention = DecoderSelfAttention::new(&mut store, "self", 3, &LinearInit::default())?;
        let only = Tensor::new(&[[0.5f32, -1.0, 2.0]], &device)?;
        let mut history = OutputHistory::new();
        history.push(only.clone());
        let output = attention.attend(&history)?;
        let diff = output.context.sub(&only)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}

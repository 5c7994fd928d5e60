//! Local attention around a predicted window centre.
//!
//! For each batch row the branch predicts a centre
//! `pt = floor(S * sigmoid(sum(vp * tanh(h_t))))`, builds a 0/1 window mask
//! covering `[pt - D + 1, pt + D]` and a Gaussian taper with `sigma = D / 2`,
//! then weights the encoder states by `softmax(scores * mask) * taper`.
//!
//! The weights are not renormalised after the taper, and the mask multiplies
//! the scores instead of sending them to negative infinity, so positions
//! outside the window keep a small non-zero weight.
//!
//! Where `h_t` comes from depends on the content function. The full-width
//! additive scorers obtain it from the same fused projection that produces
//! the query features (`Linear([q, q]) -> [y | h_t]`); every other function
//! uses a dedicated prediction projection `q -> hidden`.

use candle_core::{DType, Tensor, Var, D};
use candle_nn::ops::softmax;
use layers::{
    activations::sigmoid, Linear, LinearConfig, LinearInit, LinearLayer, ParameterStore,
    PrecisionPolicy,
};

use crate::core::{AttentionError, AttentionOutput, ContentFunction, ContextAttention};
use crate::masks::{gaussian_taper, snap_centres, window_mask};
use crate::scoring::{weighted_sum, ContentScorer, EncoderMemory};

#[derive(Debug, Clone)]
enum CentreSource {
    /// Separate `q -> hidden` projection feeding the centre predictor.
    Prediction(Linear),
    /// One projection over `[q, q]` whose shards are the query features and `h_t`.
    Fused(Linear),
}

/// Local attention branch with its own scorer and centre predictor.
#[derive(Debug, Clone)]
pub struct LocalAttention {
    scorer: ContentScorer,
    centre: CentreSource,
    position_vector: Var,
    window_size: usize,
    policy: PrecisionPolicy,
}

impl LocalAttention {
    /// Registers the branch parameters under `scope`.
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        function: ContentFunction,
        query_dim: usize,
        hidden: usize,
        window_size: usize,
        init: &LinearInit,
    ) -> Result<Self, AttentionError> {
        if window_size == 0 {
            return Err(AttentionError::config(
                "local attention requires window_size > 0",
            ));
        }
        let policy = PrecisionPolicy::from_parameter_dtype(store.dtype());
        let (scorer, centre) = if function.uses_weight_vector() {
            let config = LinearConfig {
                input_dim: 2 * query_dim,
                output_dim: hidden,
                bias: true,
                fused_projections: 2,
            };
            let fused = Linear::register(store, &format!("{scope}/query_centre"), config, init)?;
            (
                ContentScorer::external_query(function, query_dim, policy),
                CentreSource::Fused(fused),
            )
        } else {
            let scorer = ContentScorer::new(store, scope, function, query_dim, hidden, init)?;
            let predict = Linear::register(
                store,
                &format!("{scope}/predict"),
                LinearConfig::new(query_dim, hidden),
                init,
            )?;
            (scorer, CentreSource::Prediction(predict))
        };
        let position_vector = store.sample(&format!("{scope}/vp"), &[hidden], init)?;
        Ok(Self {
            scorer,
            centre,
            position_vector,
            window_size,
            policy,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Raw alignment scores and the predicted window centres for `query`.
    fn scores_and_centres(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<(Tensor, Vec<f32>), AttentionError> {
        let (scores, centre_features) = match &self.centre {
            CentreSource::Fused(linear) => {
                let joint = linear.forward_concat(&[query, query], &self.policy)?;
                let features = linear.shard(&joint, 0)?;
                let centre = linear.shard(&joint, 1)?;
                (self.scorer.combine(&features, memory)?, centre)
            }
            CentreSource::Prediction(linear) => {
                let scores = self.scorer.score(query, memory)?;
                (scores, linear.forward(query, &self.policy)?)
            }
        };

        let vp = self.policy.cast_for_matmul(self.position_vector.as_tensor())?;
        let centre_features = self.policy.cast_for_matmul(&centre_features)?;
        let energy = centre_features.tanh()?.broadcast_mul(&vp)?.sum(1)?;
        let source_len = memory.source_len() as f64;
        let raw = sigmoid(&energy)?
            .affine(source_len, 0.0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        Ok((scores, snap_centres(&raw, memory.source_len())))
    }

    /// Predicted window centres without computing the context.
    pub fn centres(&self, query: &Tensor, memory: &EncoderMemory) -> Result<Vec<f32>, AttentionError> {
        Ok(self.scores_and_centres(query, memory)?.1)
    }
}

impl ContextAttention for LocalAttention {
    fn attend(
        &self,
        query: &Tensor,
        memory: &EncoderMemory,
    ) -> Result<AttentionOutput, AttentionError> {
        let (scores, centres) = self.scores_and_centres(query, memory)?;
        let device = memory.states().device();
        let source_len = memory.source_len();
        let mask = window_mask(device, &centres, self.window_size, source_len)?
            .to_dtype(scores.dtype())?;
        let taper = gaussian_taper(device, &centres, self.window_size, source_len)?
            .to_dtype(scores.dtype())?;

        let masked = softmax(&scores.mul(&mask)?, D::Minus1)?;
        let weights = masked.mul(&taper)?;
        let context = weighted_sum(&weights, memory.states())?;
        log::trace!("local attention centres {:?}", centres);
        Ok(AttentionOutput {
            context,
            weights,
            window_centres: Some(centres),
            gate: None,
        })
    }
}

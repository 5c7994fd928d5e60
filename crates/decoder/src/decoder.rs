//! The attention decoder step loop.
//!
//! [`AttentionDecoder`] is assembled once from a [`DecoderConfig`], a
//! recurrent cell and a [`ParameterStore`]; every parameter is registered at
//! construction time. A decode call projects the encoder states once and then
//! runs a [`DecodeSession`] through its steps:
//!
//! 1. the step input is either the caller's input or, from step 1 on and when
//!    a feedback policy is given, the policy applied to the previous output
//!    (detached);
//! 2. with input feeding, the previous context is appended to the input;
//! 3. with input/attention combination, `[input, context]` goes through
//!    `tanh(Linear(..))` down to the cell input width;
//! 4. the cell runs and its output joins the output history;
//! 5. the attention query is the cell output, or the previous history entry
//!    for the Bahdanau-style scorer (zeros when there is none yet);
//! 6. the configured attention mechanism produces the new context;
//! 7. the output is `tanh(Linear([o, context]))` where `o` is the cell output
//!    or, with output attention, the self-attention context over the history.

use std::sync::OnceLock;

use attention::{
    AttentionMechanism, AttentionOutput, ContextAttention, DecoderSelfAttention, EncoderMemory,
    EncoderProjection, OutputHistory,
};
use candle_core::{Device, Tensor};
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{checks, Linear, LinearConfig, ParameterStore, PrecisionPolicy};

use crate::cell::RecurrentCell;
use crate::config::{DecoderConfig, OutputProjection};
use crate::errors::DecoderError;
use crate::feedback::{ArgmaxEmbed, FeedbackPolicy};

/// Scope under which a standalone decoder registers its parameters.
pub const DEFAULT_SCOPE: &str = "attention_decoder";

/// Externally owned output history for incremental decoding.
#[derive(Debug, Clone)]
pub struct PriorHistory {
    /// Previously emitted cell outputs, `[batch, steps, hidden]`.
    pub stacked: Tensor,
    /// Number of steps held by `stacked`.
    pub steps: usize,
}

impl PriorHistory {
    pub fn new(stacked: Tensor, steps: usize) -> Self {
        Self { stacked, steps }
    }
}

/// Everything a finished decode call produces.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    /// One `[batch, output_size]` tensor per step.
    pub outputs: Vec<Tensor>,
    pub final_state: Tensor,
    /// Stacked cell outputs `[batch, steps, cell_output_size]`, including any prior history.
    pub history: Tensor,
    /// Encoder attention of every step.
    pub attention: Vec<AttentionOutput>,
}

/// Position of a [`DecodeSession`] in its step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    /// Number of steps completed so far.
    Stepping(usize),
    Done,
}

pub struct AttentionDecoder<C: RecurrentCell> {
    config: DecoderConfig,
    cell: C,
    hidden: usize,
    input_size: usize,
    output_size: usize,
    encoder: EncoderProjection,
    mechanism: AttentionMechanism,
    self_attention: Option<DecoderSelfAttention>,
    combine: Option<Linear>,
    output: Linear,
    device: Device,
    policy: PrecisionPolicy,
    first_call: OnceLock<()>,
}

impl<C: RecurrentCell> AttentionDecoder<C> {
    pub fn new(
        config: DecoderConfig,
        cell: C,
        store: &mut ParameterStore,
    ) -> Result<Self, DecoderError> {
        Self::with_scope(config, cell, store, DEFAULT_SCOPE)
    }

    /// Validates the configuration against `cell` and registers every parameter under `scope`.
    pub fn with_scope(
        config: DecoderConfig,
        mut cell: C,
        store: &mut ParameterStore,
        scope: &str,
    ) -> Result<Self, DecoderError> {
        config.validate_for_cell(cell.input_size(), cell.output_size())?;
        if let Some(dropout) = config.dropout {
            cell.set_input_keep_prob(1.0 - dropout)?;
        }

        let hidden = config.hidden_size;
        let input_size = config.resolved_input_size(cell.input_size());
        let output_size = config.resolved_output_size(cell.output_size());
        let init = config.init.linear_init();
        let attention_config = config.attention_config()?;
        let function = config.content_function;

        let encoder = EncoderProjection::new(store, &format!("{scope}/encoder"), function, hidden, &init)?;
        let mechanism = AttentionMechanism::new(
            store,
            &format!("{scope}/attention"),
            &attention_config,
            cell.output_size(),
            hidden,
            &init,
        )?;
        let self_attention = if config.output_attention {
            Some(DecoderSelfAttention::new(
                store,
                &format!("{scope}/output_attention"),
                hidden,
                &init,
            )?)
        } else {
            None
        };
        let combine = if config.combine_input_attention {
            let fed = input_size + if config.input_feeding { hidden } else { 0 };
            Some(Linear::register(
                store,
                &format!("{scope}/combine"),
                LinearConfig::new(fed + hidden, cell.input_size()),
                &init,
            )?)
        } else {
            None
        };
        let projected = if config.output_attention { hidden } else { cell.output_size() };
        let output = Linear::register(
            store,
            &format!("{scope}/output_projection"),
            LinearConfig::new(projected + hidden, output_size),
            &init,
        )?;
        log::debug!(
            "registered {scope}: store now holds {} parameters ({} weights)",
            store.len(),
            store.num_elements()
        );

        Ok(Self {
            config,
            cell,
            hidden,
            input_size,
            output_size,
            encoder,
            mechanism,
            self_attention,
            combine,
            output,
            device: store.device().clone(),
            policy: PrecisionPolicy::from_parameter_dtype(store.dtype()),
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn cell(&self) -> &C {
        &self.cell
    }

    /// Width expected of every caller-supplied step input.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Runs one step per entry of `inputs` and returns the collected results.
    pub fn decode(
        &self,
        inputs: &[Tensor],
        initial_state: &Tensor,
        encoder_states: &Tensor,
        feedback: Option<&dyn FeedbackPolicy>,
        prior: Option<PriorHistory>,
    ) -> Result<DecodeOutput, DecoderError> {
        let mut session = self.start(
            inputs.len(),
            initial_state,
            encoder_states,
            feedback,
            prior,
        )?;
        for input in inputs {
            session.step(input)?;
        }
        session.finish()
    }

    /// Prepares a session that accepts exactly `steps` calls to [`DecodeSession::step`].
    pub fn start<'a>(
        &'a self,
        steps: usize,
        initial_state: &Tensor,
        encoder_states: &Tensor,
        feedback: Option<&'a dyn FeedbackPolicy>,
        prior: Option<PriorHistory>,
    ) -> Result<DecodeSession<'a, C>, DecoderError> {
        if steps == 0 {
            return Err(DecoderError::session("a decode call needs at least one step"));
        }
        let memory = self.encoder.project(encoder_states)?;
        let batch = memory.batch();
        checks::expect_shape(
            "initial decoder state",
            initial_state,
            &[batch, self.cell.state_size()],
        )
        .map_err(|err| DecoderError::shape(err.to_string()))?;

        let history = match prior {
            None => HistoryBuffer::Owned(OutputHistory::new()),
            Some(prior) => {
                if self.self_attention.is_none() {
                    return Err(DecoderError::history(
                        "a prior history is only consumed when output_attention is enabled",
                    ));
                }
                match prior.stacked.dims() {
                    [b, t, h] if *b == batch && *t == prior.steps && *h == self.cell.output_size() => {}
                    dims => {
                        return Err(DecoderError::history(format!(
                            "prior history {:?} does not match batch {}, {} steps and width {}",
                            dims,
                            batch,
                            prior.steps,
                            self.cell.output_size()
                        )))
                    }
                }
                HistoryBuffer::External {
                    stacked: (prior.steps > 0).then_some(prior.stacked),
                    steps: prior.steps,
                }
            }
        };

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention decoder init attention={:?} content={} window={} input_feeding={} combine={} output_attention={} output_size={}",
                self.mechanism.attention_type(),
                self.config.content_function,
                self.config.window_size,
                self.config.input_feeding,
                self.config.combine_input_attention,
                self.config.output_attention,
                self.output_size
            );
        }

        Ok(DecodeSession {
            decoder: self,
            feedback,
            context: Tensor::zeros((batch, self.hidden), memory.states().dtype(), &self.device)?,
            memory,
            state: initial_state.clone(),
            history,
            previous_output: None,
            outputs: Vec::with_capacity(steps),
            attention: Vec::with_capacity(steps),
            total_steps: steps,
            phase: Phase::Init,
        })
    }
}

/// Output history owned by the session or threaded through from a previous call.
#[derive(Debug)]
enum HistoryBuffer {
    Owned(OutputHistory),
    External {
        stacked: Option<Tensor>,
        steps: usize,
    },
}

impl HistoryBuffer {
    fn push(&mut self, output: &Tensor) -> Result<(), DecoderError> {
        match self {
            HistoryBuffer::Owned(history) => history.push(output.clone()),
            HistoryBuffer::External { stacked, steps } => {
                let step = output.unsqueeze(1)?;
                *stacked = Some(match stacked.take() {
                    None => step,
                    Some(prev) => Tensor::cat(&[&prev, &step], 1)?,
                });
                *steps += 1;
            }
        }
        Ok(())
    }

    /// Entry emitted one step before the most recent one.
    fn previous(&self) -> Result<Option<Tensor>, DecoderError> {
        match self {
            HistoryBuffer::Owned(history) => Ok(history.previous().cloned()),
            HistoryBuffer::External { stacked, steps } => match (stacked, *steps) {
                (Some(stacked), steps) if steps >= 2 => {
                    Ok(Some(stacked.narrow(1, steps - 2, 1)?.squeeze(1)?))
                }
                _ => Ok(None),
            },
        }
    }

    fn self_attend(
        &self,
        attention: &DecoderSelfAttention,
    ) -> Result<Tensor, DecoderError> {
        let output = match self {
            HistoryBuffer::Owned(history) => attention.attend(history)?,
            HistoryBuffer::External { stacked, steps } => {
                let stacked = stacked
                    .as_ref()
                    .ok_or_else(|| DecoderError::history("external history is empty"))?;
                attention.attend_incremental(stacked, *steps)?
            }
        };
        Ok(output.context)
    }

    fn into_stacked(self) -> Result<Tensor, DecoderError> {
        match self {
            HistoryBuffer::Owned(history) => Ok(history.stacked()?),
            HistoryBuffer::External { stacked, .. } => {
                stacked.ok_or_else(|| DecoderError::history("external history is empty"))
            }
        }
    }
}

/// One decode call, advanced a step at a time.
pub struct DecodeSession<'a, C: RecurrentCell> {
    decoder: &'a AttentionDecoder<C>,
    feedback: Option<&'a dyn FeedbackPolicy>,
    memory: EncoderMemory,
    state: Tensor,
    context: Tensor,
    history: HistoryBuffer,
    previous_output: Option<Tensor>,
    outputs: Vec<Tensor>,
    attention: Vec<AttentionOutput>,
    total_steps: usize,
    phase: Phase,
}

impl<'a, C: RecurrentCell> DecodeSession<'a, C> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current recurrent state.
    pub fn state(&self) -> &Tensor {
        &self.state
    }

    /// Context produced by the most recent step (zeros before the first).
    pub fn context(&self) -> &Tensor {
        &self.context
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    /// Runs one step on `input` `[batch, input_size]` and returns the emitted output.
    pub fn step(&mut self, input: &Tensor) -> Result<Tensor, DecoderError> {
        let index = match self.phase {
            Phase::Init => 0,
            Phase::Stepping(done) => done,
            Phase::Done => {
                return Err(DecoderError::session(format!(
                    "all {} steps have already run",
                    self.total_steps
                )))
            }
        };
        let decoder = self.decoder;
        let policy = &decoder.policy;

        let input = match (self.feedback, &self.previous_output) {
            (Some(feedback), Some(previous)) => feedback.next_input(previous, index)?.detach(),
            _ => input.clone(),
        };
        checks::expect_shape(
            "decoder step input",
            &input,
            &[self.memory.batch(), decoder.input_size],
        )
        .map_err(|err| DecoderError::shape(err.to_string()))?;

        let input = if decoder.config.input_feeding {
            Tensor::cat(&[&input, &self.context], 1)?
        } else {
            input
        };
        let cell_input = match &decoder.combine {
            Some(combine) => combine
                .forward_concat(&[&input, &self.context], policy)?
                .tanh()?,
            None => input,
        };

        let (cell_output, next_state) = decoder.cell.step(&cell_input, &self.state)?;
        self.state = next_state;
        self.history.push(&cell_output)?;

        let query = if decoder.config.content_function.queries_previous_output() {
            match self.history.previous()? {
                Some(previous) => previous,
                None => cell_output.zeros_like()?,
            }
        } else {
            cell_output.clone()
        };
        let attended = decoder.mechanism.attend(&query, &self.memory)?;
        self.context = attended.context.clone();

        let projected = match &decoder.self_attention {
            Some(self_attention) => self.history.self_attend(self_attention)?,
            None => cell_output,
        };
        let output = decoder
            .output
            .forward_concat(&[&projected, &self.context], policy)?
            .tanh()?;

        if log::log_enabled!(log::Level::Debug) {
            let gate = attended
                .gate
                .as_ref()
                .map(|gate| gate.flatten_all()?.to_vec1::<f32>())
                .transpose()?;
            log::debug!(
                "decoder step {} centres={:?} gate={:?}",
                index,
                attended.window_centres,
                gate
            );
        }

        if self.feedback.is_some() {
            self.previous_output = Some(output.detach());
        }
        self.outputs.push(output.clone());
        self.attention.push(attended);

        let done = index + 1;
        self.phase = if done == self.total_steps {
            Phase::Done
        } else {
            Phase::Stepping(done)
        };
        Ok(output)
    }

    /// Collects the results once every step has run.
    pub fn finish(self) -> Result<DecodeOutput, DecoderError> {
        if self.phase != Phase::Done {
            return Err(DecoderError::session(format!(
                "session finished after {} of {} steps",
                self.outputs.len(),
                self.total_steps
            )));
        }
        Ok(DecodeOutput {
            outputs: self.outputs,
            final_state: self.state,
            history: self.history.into_stacked()?,
            attention: self.attention,
        })
    }
}

/// Decoder that embeds symbol ids and feeds back its own argmax predictions.
pub struct EmbeddingAttentionDecoder<C: RecurrentCell> {
    decoder: AttentionDecoder<C>,
    embedding: TokenEmbedding,
    projection: Option<OutputProjection>,
}

impl<C: RecurrentCell> EmbeddingAttentionDecoder<C> {
    /// Scope under which the embedding front-end registers its parameters.
    pub const SCOPE: &'static str = "embedding_attention_decoder";

    /// Checks `projection` before any parameter is created, then registers the
    /// embedding table of width `cell.input_size / 2` under input feeding and
    /// `cell.input_size` otherwise.
    pub fn new(
        mut config: DecoderConfig,
        cell: C,
        store: &mut ParameterStore,
        projection: Option<OutputProjection>,
    ) -> Result<Self, DecoderError> {
        let width = if config.input_feeding {
            cell.input_size() / 2
        } else {
            cell.input_size()
        };
        if config.input_size.is_some_and(|size| size != width) {
            return Err(DecoderError::validation(vec![format!(
                "embedding decoder step inputs are {width} wide, config asks for {:?}",
                config.input_size
            )]));
        }
        config.input_size = Some(width);
        config.validate_for_embedding(cell.input_size(), cell.output_size(), projection.as_ref())?;

        let init = config.init.linear_init();
        let embedding = TokenEmbedding::register(
            store,
            Self::SCOPE,
            TokenEmbeddingConfig::new(config.num_symbols, width),
            &init,
        )?;
        let decoder = AttentionDecoder::with_scope(
            config,
            cell,
            store,
            &format!("{}/{}", Self::SCOPE, DEFAULT_SCOPE),
        )?;
        Ok(Self {
            decoder,
            embedding,
            projection,
        })
    }

    pub fn decoder(&self) -> &AttentionDecoder<C> {
        &self.decoder
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    /// Decodes one `[batch]` tensor of symbol ids per step.
    pub fn decode(
        &self,
        symbols: &[Tensor],
        initial_state: &Tensor,
        encoder_states: &Tensor,
        prior: Option<PriorHistory>,
    ) -> Result<DecodeOutput, DecoderError> {
        let inputs = symbols
            .iter()
            .map(|ids| self.embedding.forward(ids))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let argmax = ArgmaxEmbed::new(&self.embedding, self.projection.as_ref());
        let feedback: Option<&dyn FeedbackPolicy> = if self.decoder.config.feed_previous {
            Some(&argmax)
        } else {
            None
        };
        self.decoder
            .decode(&inputs, initial_state, encoder_states, feedback, prior)
    }
}

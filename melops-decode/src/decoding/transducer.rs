//! Greedy and modified beam search over a transducer.

use crate::config::{DecodingMethod, RecognizerConfig};
use crate::decoding::{DecodingStrategy, log_add, log_softmax, output_length, pad_batch};
use crate::error::{BackendError, Result};
use crate::models::TransducerModel;
use crate::types::{DecodeMode, DecodeProgress, DecodedToken};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use std::cmp::Ordering;

/// One search path: emitted tokens, decoder context and score.
#[derive(Clone, Debug)]
pub struct Hypothesis {
    tokens: Vec<DecodedToken>,
    /// Last `context_size` token ids, blank-padded on the left
    context: Vec<i64>,
    log_prob: f32,
    /// Decoder output for `context`, computed lazily
    decoder_out: Option<Array1<f32>>,
}

impl Hypothesis {
    fn initial(blank_id: usize, context_size: usize) -> Self {
        Self {
            tokens: Vec::new(),
            context: vec![blank_id as i64; context_size],
            log_prob: 0.0,
            decoder_out: None,
        }
    }

    pub fn tokens(&self) -> &[DecodedToken] {
        &self.tokens
    }

    pub fn log_prob(&self) -> f32 {
        self.log_prob
    }

    /// Same path after a blank.
    fn with_blank(&self, log_prob: f32) -> Self {
        Self {
            log_prob,
            ..self.clone()
        }
    }

    /// Path extended by a non-blank token.
    fn extend(&self, token: usize, frame: usize, log_prob: f32) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(DecodedToken::new(token, Some(frame)));

        let mut context = self.context.clone();
        if !context.is_empty() {
            context.remove(0);
            context.push(token as i64);
        }

        Self {
            tokens,
            context,
            log_prob,
            decoder_out: None,
        }
    }

    fn same_tokens(&self, other: &Self) -> bool {
        self.tokens.len() == other.tokens.len()
            && self.tokens.iter().zip(&other.tokens).all(|(a, b)| a.id == b.id)
    }
}

/// Higher score first; on equal score fewer tokens first.
fn rank(score_a: f32, len_a: usize, score_b: f32, len_b: usize) -> Ordering {
    score_b.total_cmp(&score_a).then(len_a.cmp(&len_b))
}

fn sort_hyps(hyps: &mut [Hypothesis]) {
    hyps.sort_by(|a, b| rank(a.log_prob, a.tokens.len(), b.log_prob, b.tokens.len()));
}

/// Transducer decode state: active hypotheses, best first.
#[derive(Clone, Debug)]
pub struct TransducerState<S> {
    hyps: Vec<Hypothesis>,
    encoder_state: S,
    frames_decoded: usize,
}

impl<S> TransducerState<S> {
    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hyps
    }

    pub fn best(&self) -> Option<&Hypothesis> {
        self.hyps.first()
    }

    pub fn encoder_state(&self) -> &S {
        &self.encoder_state
    }

    /// Encoder frames folded into the hypotheses.
    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }
}

/// One greedy step: best token or blank.
fn greedy_step(
    hyp: &Hypothesis,
    logp: &Array1<f32>,
    blank_id: usize,
    frame: usize,
) -> Result<Hypothesis> {
    let token = logp.argmax()?;
    let log_prob = hyp.log_prob + logp[token];

    Ok(if token == blank_id {
        hyp.with_blank(log_prob)
    } else {
        hyp.extend(token, frame, log_prob)
    })
}

/// One modified beam search step: at most one symbol per frame.
///
/// The `beam` best (hypothesis, symbol) pairs survive; paths with identical
/// token sequences are merged by summing their probabilities.
fn beam_step(
    hyps: &[Hypothesis],
    logps: &[Array1<f32>],
    blank_id: usize,
    frame: usize,
    beam: usize,
) -> Vec<Hypothesis> {
    let mut candidates: Vec<(f32, usize, usize, usize)> = hyps
        .iter()
        .zip(logps)
        .enumerate()
        .flat_map(|(j, (hyp, logp))| {
            logp.iter().enumerate().map(move |(k, &lp)| {
                let len = hyp.tokens.len() + usize::from(k != blank_id);
                (hyp.log_prob + lp, len, j, k)
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        rank(a.0, a.1, b.0, b.1)
            .then(a.2.cmp(&b.2))
            .then(a.3.cmp(&b.3))
    });
    candidates.truncate(beam);

    let mut next: Vec<Hypothesis> = Vec::with_capacity(beam);
    for (score, _, j, k) in candidates {
        let hyp = if k == blank_id {
            hyps[j].with_blank(score)
        } else {
            hyps[j].extend(k, frame, score)
        };

        match next.iter_mut().find(|existing| existing.same_tokens(&hyp)) {
            Some(existing) => existing.log_prob = log_add(existing.log_prob, hyp.log_prob),
            None => next.push(hyp),
        }
    }

    sort_hyps(&mut next);
    next
}

/// Transducer search strategy over a [`TransducerModel`].
pub struct TransducerSearch<M> {
    model: M,
    method: DecodingMethod,
    beam: usize,
}

impl<M: TransducerModel> TransducerSearch<M> {
    /// Search with the decoding method and beam width of `config`.
    pub fn new(model: M, config: &RecognizerConfig) -> Self {
        Self {
            model,
            method: config.decoding_method,
            beam: config.beam_width(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn method(&self) -> DecodingMethod {
        self.method
    }

    /// Maximum number of active hypotheses.
    pub fn beam(&self) -> usize {
        self.beam
    }

    /// Run the decoder once for every hypothesis missing its output.
    fn fill_decoder_out(&mut self, working: &mut [Vec<Hypothesis>]) -> Result<()> {
        let mut pending: Vec<&mut Hypothesis> = working
            .iter_mut()
            .flat_map(|hyps| hyps.iter_mut())
            .filter(|hyp| hyp.decoder_out.is_none())
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let context_size = self.model.context_size();
        let contexts = Array2::from_shape_fn((pending.len(), context_size), |(row, col)| {
            pending[row].context[col]
        });

        let decoder_out = self.model.run_decoder(contexts)?;
        if decoder_out.nrows() != pending.len() {
            return Err(BackendError::ShapeMismatch {
                name: "decoder_out".to_string(),
                expected: vec![pending.len(), decoder_out.ncols()],
                got: decoder_out.shape().to_vec(),
            }
            .into());
        }

        for (hyp, row) in pending.iter_mut().zip(decoder_out.rows()) {
            hyp.decoder_out = Some(row.to_owned());
        }
        Ok(())
    }

    /// Joiner log-probabilities for every hypothesis of the active streams at frame `t`.
    fn join_frame(
        &mut self,
        encoder_out: &Array3<f32>,
        t: usize,
        active: &[usize],
        working: &[Vec<Hypothesis>],
    ) -> Result<Vec<Array1<f32>>> {
        let rows: Vec<(usize, &Hypothesis)> = active
            .iter()
            .flat_map(|&i| working[i].iter().map(move |hyp| (i, hyp)))
            .collect();

        let encoder_dim = encoder_out.dim().2;
        let decoder_dim = rows
            .iter()
            .find_map(|(_, hyp)| hyp.decoder_out.as_ref().map(Array1::len))
            .unwrap_or(0);

        let mut encoder_rows = Array2::<f32>::zeros((rows.len(), encoder_dim));
        let mut decoder_rows = Array2::<f32>::zeros((rows.len(), decoder_dim));
        for (r, (i, hyp)) in rows.iter().enumerate() {
            encoder_rows
                .row_mut(r)
                .assign(&encoder_out.slice(s![*i, t, ..]));
            if let Some(decoder_out) = &hyp.decoder_out {
                decoder_rows.row_mut(r).assign(decoder_out);
            }
        }

        let logits = self.model.run_joiner(encoder_rows, decoder_rows)?;
        let blank_id = self.model.blank_id();
        if logits.nrows() != rows.len() || logits.ncols() <= blank_id {
            return Err(BackendError::ShapeMismatch {
                name: "logit".to_string(),
                expected: vec![rows.len(), blank_id + 1],
                got: logits.shape().to_vec(),
            }
            .into());
        }

        Ok(logits.rows().into_iter().map(log_softmax).collect())
    }
}

impl<M: TransducerModel> DecodingStrategy for TransducerSearch<M> {
    type State = TransducerState<M::EncoderState>;

    fn mode(&self) -> DecodeMode {
        self.model.mode()
    }

    fn feature_dim(&self) -> usize {
        self.model.feature_dim()
    }

    fn frame_shift_secs(&self) -> f32 {
        self.model.frame_shift_secs()
    }

    fn new_state(&self) -> Self::State {
        TransducerState {
            hyps: vec![Hypothesis::initial(
                self.model.blank_id(),
                self.model.context_size(),
            )],
            encoder_state: self.model.init_encoder_state(),
            frames_decoded: 0,
        }
    }

    fn decode(
        &mut self,
        features: &[Array2<f32>],
        states: &[&Self::State],
    ) -> Result<Vec<Self::State>> {
        if features.is_empty() {
            return Ok(Vec::new());
        }

        let batch = states.len();
        let (padded, lengths) = pad_batch(features, 0.0);
        let encoder_states: Vec<&M::EncoderState> =
            states.iter().map(|state| &state.encoder_state).collect();

        let (encoder_out, out_lengths, encoder_states) =
            self.model.encode(padded, lengths, &encoder_states)?;

        if encoder_out.dim().0 != batch || encoder_states.len() != batch {
            return Err(BackendError::ShapeMismatch {
                name: "encoder_out".to_string(),
                expected: vec![batch],
                got: vec![encoder_out.dim().0, encoder_states.len()],
            }
            .into());
        }

        let num_frames = encoder_out.dim().1;
        let frame_counts: Vec<usize> = (0..batch)
            .map(|i| output_length(&out_lengths, i, num_frames))
            .collect();

        let mut working: Vec<Vec<Hypothesis>> =
            states.iter().map(|state| state.hyps.clone()).collect();

        let blank_id = self.model.blank_id();
        let max_frames = frame_counts.iter().copied().max().unwrap_or(0);

        for t in 0..max_frames {
            let active: Vec<usize> = (0..batch).filter(|&i| t < frame_counts[i]).collect();

            self.fill_decoder_out(&mut working)?;
            let logps = self.join_frame(&encoder_out, t, &active, &working)?;

            let mut offset = 0;
            for &i in &active {
                let frame = states[i].frames_decoded + t;
                let count = working[i].len();
                let stream_logps = &logps[offset..offset + count];
                offset += count;

                working[i] = if self.beam == 1 {
                    vec![greedy_step(&working[i][0], &stream_logps[0], blank_id, frame)?]
                } else {
                    beam_step(&working[i], stream_logps, blank_id, frame, self.beam)
                };
            }

            tracing::trace!(frame = t, active = active.len(), "transducer step");
        }

        Ok(working
            .into_iter()
            .zip(encoder_states)
            .zip(states.iter().zip(&frame_counts))
            .map(|((hyps, encoder_state), (state, &frames))| TransducerState {
                hyps,
                encoder_state,
                frames_decoded: state.frames_decoded + frames,
            })
            .collect())
    }

    fn progress(&self, state: &Self::State) -> DecodeProgress {
        let tokens = state.best().map(Hypothesis::tokens).unwrap_or_default();

        DecodeProgress {
            frames_decoded: state.frames_decoded,
            last_token_frame: tokens.last().and_then(|token| token.frame),
            has_tokens: !tokens.is_empty(),
        }
    }

    fn best(&self, state: &Self::State) -> Vec<DecodedToken> {
        state
            .best()
            .map(|hyp| hyp.tokens.clone())
            .unwrap_or_default()
    }
}

//! Arg-max decoding for CTC and Paraformer outputs.

use crate::decoding::{DecodingStrategy, output_length, pad_batch};
use crate::error::{BackendError, Result};
use crate::models::{CtcModel, OutputAlignment};
use crate::types::{DecodeMode, DecodeProgress, DecodedToken};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

/// Cumulative best path of one stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CtcState {
    tokens: Vec<DecodedToken>,
    /// Symbol of the last decoded frame, blank included
    prev: Option<usize>,
    frames_decoded: usize,
}

impl CtcState {
    pub fn tokens(&self) -> &[DecodedToken] {
        &self.tokens
    }

    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }
}

/// Collapse per-frame symbols: drop repeats of the previous symbol, then blanks.
///
/// `prev` is the symbol of the frame before `symbols[0]`, so a run split
/// across chunks still collapses. Returns `(frame, symbol)` of each emitted
/// token and the last symbol seen.
pub fn collapse(
    symbols: &[usize],
    blank_id: usize,
    prev: Option<usize>,
) -> (Vec<(usize, usize)>, Option<usize>) {
    let mut emitted = Vec::new();
    let mut prev = prev;

    for (frame, &symbol) in symbols.iter().enumerate() {
        if symbol != blank_id && Some(symbol) != prev {
            emitted.push((frame, symbol));
        }
        prev = Some(symbol);
    }

    (emitted, prev)
}

/// CTC / Paraformer strategy over a [`CtcModel`].
pub struct CtcDecoder<M> {
    model: M,
}

impl<M: CtcModel> CtcDecoder<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Fold one stream's scores into its state.
    fn advance(&self, state: &CtcState, scores: ArrayView2<f32>) -> Result<CtcState> {
        let blank_id = self.model.blank_id();
        let symbols = scores
            .rows()
            .into_iter()
            .map(|row| row.argmax())
            .collect::<std::result::Result<Vec<usize>, _>>()?;

        let mut next = state.clone();
        match self.model.alignment() {
            OutputAlignment::Frame => {
                let (emitted, prev) = collapse(&symbols, blank_id, state.prev);
                next.tokens.extend(emitted.into_iter().map(|(frame, id)| {
                    DecodedToken::new(id, Some(state.frames_decoded + frame))
                }));
                next.prev = prev;
            }
            OutputAlignment::Token => {
                next.tokens.extend(
                    symbols
                        .into_iter()
                        .filter(|&id| id != blank_id)
                        .map(|id| DecodedToken::new(id, None)),
                );
            }
        }
        next.frames_decoded += scores.nrows();

        Ok(next)
    }
}

impl<M: CtcModel> DecodingStrategy for CtcDecoder<M> {
    type State = CtcState;

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
        CtcState::default()
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
        let (scores, out_lengths) = self.model.forward(padded, lengths)?;

        let blank_id = self.model.blank_id();
        if scores.dim().0 != batch || scores.dim().2 <= blank_id {
            return Err(BackendError::ShapeMismatch {
                name: "scores".to_string(),
                expected: vec![batch, scores.dim().1, blank_id + 1],
                got: scores.shape().to_vec(),
            }
            .into());
        }

        let positions = scores.dim().1;
        let next = states
            .iter()
            .enumerate()
            .map(|(i, state)| {
                let len = output_length(&out_lengths, i, positions);
                self.advance(state, scores.slice(s![i, ..len, ..]))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(batch, positions, "ctc batch decoded");
        Ok(next)
    }

    fn progress(&self, state: &Self::State) -> DecodeProgress {
        DecodeProgress {
            frames_decoded: state.frames_decoded,
            last_token_frame: state.tokens.last().and_then(|token| token.frame),
            has_tokens: !state.tokens.is_empty(),
        }
    }

    fn best(&self, state: &Self::State) -> Vec<DecodedToken> {
        state.tokens.clone()
    }
}

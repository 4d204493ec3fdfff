//! Autoregressive decoding with a self-attention K/V cache.

use crate::cache::KvCache;
use crate::decoding::{DecodingStrategy, pad_batch};
use crate::error::{BackendError, PreconditionError, Result};
use crate::features::LOG_ZERO_PADDING;
use crate::models::WhisperModel;
use crate::types::{DecodeMode, DecodeProgress, DecodedToken};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use std::sync::Arc;

/// Cross-attention keys and values of one utterance, `(layers, 1, frames, state)`.
///
/// Computed once per utterance and shared by every decoder step.
#[derive(Clone, Debug)]
pub struct CrossAttention {
    keys: Arc<Array4<f32>>,
    values: Arc<Array4<f32>>,
}

/// Per-stream Whisper decode state.
#[derive(Clone, Debug)]
pub struct WhisperState {
    /// Tokens fed on the next step: the prompt first, then the last token
    pending: Vec<i64>,
    /// Generated text tokens, without the prompt and end-of-text
    generated: Vec<i64>,
    self_cache: KvCache,
    cross: Option<CrossAttention>,
    /// Input frames encoded into `cross`
    frames: usize,
    /// End-of-text was produced
    finished: bool,
}

impl WhisperState {
    /// Decoder offset; equal to the self-cache valid length.
    pub fn offset(&self) -> usize {
        self.self_cache.valid_len()
    }

    pub fn self_cache(&self) -> &KvCache {
        &self.self_cache
    }

    pub fn generated(&self) -> &[i64] {
        &self.generated
    }

    /// Whether the cross-attention cache has been computed.
    pub fn is_encoded(&self) -> bool {
        self.cross.is_some()
    }

    /// End-of-text was produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Encoder-once, decoder-loop strategy over a [`WhisperModel`].
pub struct WhisperDecoder<M> {
    model: M,
}

impl<M: WhisperModel> WhisperDecoder<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Encode utterances and attach their cross-attention caches.
    ///
    /// Returns updated copies; `states` are not modified.
    pub fn encode(
        &mut self,
        features: &[Array2<f32>],
        states: &[&WhisperState],
    ) -> Result<Vec<WhisperState>> {
        let batch = states.len();
        let (padded, lengths) = pad_batch(features, LOG_ZERO_PADDING);
        let (cross_k, cross_v) = self.model.encode(padded, lengths)?;

        let layers = self.model.metadata().n_text_layer;
        for (name, array) in [("n_layer_cross_k", &cross_k), ("n_layer_cross_v", &cross_v)] {
            if array.dim().0 != layers || array.dim().1 != batch {
                return Err(BackendError::ShapeMismatch {
                    name: name.to_string(),
                    expected: vec![layers, batch],
                    got: array.shape().to_vec(),
                }
                .into());
            }
        }

        Ok(states
            .iter()
            .zip(features)
            .enumerate()
            .map(|(i, (state, chunk))| {
                let mut state = (*state).clone();
                state.cross = Some(CrossAttention {
                    keys: Arc::new(cross_k.slice(s![.., i..i + 1, .., ..]).to_owned()),
                    values: Arc::new(cross_v.slice(s![.., i..i + 1, .., ..]).to_owned()),
                });
                state.frames = chunk.nrows();
                state
            })
            .collect())
    }

    /// Feed the pending tokens and take the arg-max next token.
    ///
    /// The first step feeds the whole prompt at offset 0; later steps feed
    /// the previous token. Fails with a context overflow before the decoder
    /// runs if the tokens would not fit in the cache. On error `state` is
    /// unchanged.
    pub fn step(&mut self, state: &mut WhisperState) -> Result<i64> {
        if state.finished || state.pending.is_empty() {
            return Err(PreconditionError::DecodeFinished.into());
        }

        let cross = state.cross.as_ref().ok_or(PreconditionError::NotEncoded)?;

        let fed = state.pending.len();
        state.self_cache.check_room(fed)?;

        let tokens = Array2::from_shape_vec((1, fed), state.pending.clone())?;
        let (logits, keys, values) = self.model.decode(
            tokens,
            state.self_cache.keys(),
            state.self_cache.values(),
            cross.keys.view(),
            cross.values.view(),
            state.offset(),
        )?;

        if logits.dim().0 != 1 || logits.dim().1 != fed {
            return Err(BackendError::ShapeMismatch {
                name: "logits".to_string(),
                expected: vec![1, fed],
                got: logits.shape().to_vec(),
            }
            .into());
        }

        let token: usize = logits.slice(s![0, fed - 1, ..]).argmax()?;
        let token = token as i64;
        state.self_cache.advance(keys, values, fed)?;

        if token == self.model.metadata().eot {
            state.finished = true;
            state.pending.clear();
        } else {
            state.generated.push(token);
            state.pending = vec![token];
        }

        tracing::trace!(token, offset = state.offset(), "whisper step");
        Ok(token)
    }

    /// Run steps until end-of-text or until the pending tokens no longer fit.
    fn run_to_end(&mut self, state: &mut WhisperState) -> Result<()> {
        while !state.finished && state.self_cache.remaining() >= state.pending.len() {
            self.step(state)?;
        }
        Ok(())
    }
}

impl<M: WhisperModel> DecodingStrategy for WhisperDecoder<M> {
    type State = WhisperState;

    fn mode(&self) -> DecodeMode {
        DecodeMode::Offline
    }

    fn feature_dim(&self) -> usize {
        self.model.feature_dim()
    }

    fn frame_shift_secs(&self) -> f32 {
        self.model.frame_shift_secs()
    }

    fn new_state(&self) -> Self::State {
        let metadata = self.model.metadata();

        WhisperState {
            pending: metadata.initial_prompt(),
            generated: Vec::new(),
            self_cache: KvCache::new(
                metadata.n_text_layer,
                metadata.n_text_ctx,
                metadata.n_text_state,
            ),
            cross: None,
            frames: 0,
            finished: false,
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

        let mut next = self.encode(features, states)?;
        for state in &mut next {
            self.run_to_end(state)?;
        }

        tracing::debug!(
            batch = next.len(),
            tokens = next.iter().map(|s| s.generated.len()).sum::<usize>(),
            "whisper batch decoded"
        );
        Ok(next)
    }

    fn progress(&self, state: &Self::State) -> DecodeProgress {
        DecodeProgress {
            frames_decoded: state.frames,
            last_token_frame: None,
            has_tokens: !state.generated.is_empty(),
        }
    }

    fn best(&self, state: &Self::State) -> Vec<DecodedToken> {
        state
            .generated
            .iter()
            .map(|&id| DecodedToken::new(id.max(0) as usize, None))
            .collect()
    }
}

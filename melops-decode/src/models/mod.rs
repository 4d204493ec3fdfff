//! Inference backends, one trait per model family.
//!
//! A backend runs one forward pass per call: tensors in, tensors out. Batch
//! axes are leading; callers pad sequences to the longest member and pass
//! true lengths alongside. Weights are shared and read-only, so a backend
//! holds no per-stream state; anything carried across calls lives in the
//! strategy's per-stream decode state.
//!
//! In [`DecodeMode::Streaming`] a window of `window` input frames is passed per
//! stream and the backend returns only the output frames that correspond to
//! the first `shift` input frames; the remainder is lookahead.

pub mod ctc;
pub mod onnx;
pub mod transducer;
pub mod whisper;

use crate::error::Result;
use crate::types::DecodeMode;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView4};

pub use ctc::{OnnxNemoCtc, OnnxParaformer};
pub use transducer::{OnnxStreamingTransducer, OnnxTransducer};
pub use whisper::OnnxWhisper;

/// Encoder, prediction network and joiner of an RNN-T style model.
pub trait TransducerModel: Send {
    /// Encoder state carried between streaming windows.
    type EncoderState: Clone + Send;

    fn mode(&self) -> DecodeMode;

    /// Input feature dimension.
    fn feature_dim(&self) -> usize;

    /// Duration of one encoder output frame in seconds.
    fn frame_shift_secs(&self) -> f32;

    fn blank_id(&self) -> usize;

    /// Number of previous tokens the decoder conditions on.
    fn context_size(&self) -> usize;

    /// Fresh encoder state for a new stream or segment.
    fn init_encoder_state(&self) -> Self::EncoderState;

    /// Encode a padded batch `(N, T, dim)` with true lengths `(N,)`.
    ///
    /// Returns encoder output `(N, T', hidden)`, output lengths `(N,)` and the
    /// updated encoder state of each stream.
    fn encode(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
        states: &[&Self::EncoderState],
    ) -> Result<(Array3<f32>, Array1<i64>, Vec<Self::EncoderState>)>;

    /// Run the decoder over token contexts `(N, context_size)`, giving `(N, hidden)`.
    fn run_decoder(&mut self, contexts: Array2<i64>) -> Result<Array2<f32>>;

    /// Join encoder frames `(N, hidden)` with decoder output `(N, hidden)`,
    /// giving logits `(N, vocab)`.
    fn run_joiner(
        &mut self,
        encoder_out: Array2<f32>,
        decoder_out: Array2<f32>,
    ) -> Result<Array2<f32>>;
}

/// Whisper model constants read from encoder metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WhisperMetadata {
    pub n_text_layer: usize,
    /// Maximum decoder context; capacity of the self-attention cache
    pub n_text_ctx: usize,
    pub n_text_state: usize,
    /// Start-of-transcript prompt
    pub sot_sequence: Vec<i64>,
    pub eot: i64,
    /// Token that disables timestamp prediction, appended to the prompt
    pub no_timestamps: Option<i64>,
}

impl WhisperMetadata {
    /// Decoder prompt fed at offset 0.
    pub fn initial_prompt(&self) -> Vec<i64> {
        let mut prompt = self.sot_sequence.clone();
        prompt.extend(self.no_timestamps);
        prompt
    }
}

/// Whisper-style encoder/decoder with cross and self attention caches.
pub trait WhisperModel: Send {
    fn metadata(&self) -> &WhisperMetadata;

    /// Input feature dimension.
    fn feature_dim(&self) -> usize;

    /// Duration of one input feature frame in seconds.
    fn frame_shift_secs(&self) -> f32;

    /// Encode a padded batch `(N, T, dim)` with true lengths `(N,)`, giving
    /// cross-attention keys and values, each `(n_text_layer, N, frames, n_text_state)`.
    fn encode(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array4<f32>, Array4<f32>)>;

    /// One decoder step for a single stream.
    ///
    /// `tokens` is `(1, n)` fed at position `offset`; the caches have batch
    /// size one. Returns logits `(1, n, vocab)` and the updated self keys and
    /// values.
    fn decode(
        &mut self,
        tokens: Array2<i64>,
        self_k: ArrayView4<f32>,
        self_v: ArrayView4<f32>,
        cross_k: ArrayView4<f32>,
        cross_v: ArrayView4<f32>,
        offset: usize,
    ) -> Result<(Array3<f32>, Array4<f32>, Array4<f32>)>;
}

/// How CTC-style output positions relate to input time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputAlignment {
    /// One output per encoder frame; repeats collapse
    Frame,
    /// One output per token (Paraformer); no collapse
    Token,
}

/// Single-pass model producing per-position scores (CTC, Paraformer).
pub trait CtcModel: Send {
    fn mode(&self) -> DecodeMode;

    /// Input feature dimension.
    fn feature_dim(&self) -> usize;

    /// Duration of one output frame in seconds.
    fn frame_shift_secs(&self) -> f32;

    fn blank_id(&self) -> usize;

    fn alignment(&self) -> OutputAlignment;

    /// Forward a padded batch `(N, T, dim)` with true lengths `(N,)`.
    ///
    /// Returns scores `(N, T', vocab)` and valid output lengths `(N,)`.
    fn forward(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array3<f32>, Array1<i64>)>;
}

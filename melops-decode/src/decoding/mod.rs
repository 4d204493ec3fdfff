//! Decoding strategies, one per model family.

pub mod ctc;
pub mod transducer;
pub mod whisper;

use crate::error::Result;
use crate::types::{DecodeMode, DecodeProgress, DecodedToken};
use ndarray::{Array1, Array2, Array3, ArrayView1, s};

pub use ctc::{CtcDecoder, CtcState};
pub use transducer::{Hypothesis, TransducerSearch, TransducerState};
pub use whisper::{WhisperDecoder, WhisperState};

/// Turns backend outputs into tokens for a batch of streams.
///
/// The family is fixed by the recognizer's type parameter, so there is no
/// per-step dispatch on model kind.
pub trait DecodingStrategy: Send {
    /// Per-stream decode state.
    type State: Clone + Send;

    /// How streams feed this strategy.
    fn mode(&self) -> DecodeMode;

    /// Feature dimension the backend expects.
    fn feature_dim(&self) -> usize;

    /// Duration of one output frame in seconds; unit of decode progress.
    fn frame_shift_secs(&self) -> f32;

    /// State for a new stream or segment.
    fn new_state(&self) -> Self::State;

    /// Decode one chunk of features per stream.
    ///
    /// `features[i]` belongs to `states[i]`. Returns the successor state of
    /// every stream; the inputs are left untouched so a failed call changes
    /// nothing.
    fn decode(
        &mut self,
        features: &[Array2<f32>],
        states: &[&Self::State],
    ) -> Result<Vec<Self::State>>;

    /// Frames decoded and token positions of a state.
    fn progress(&self, state: &Self::State) -> DecodeProgress;

    /// Current best token sequence.
    fn best(&self, state: &Self::State) -> Vec<DecodedToken>;
}

/// Stack per-stream feature chunks into `(N, T_max, dim)` with true lengths.
pub fn pad_batch(features: &[Array2<f32>], pad_value: f32) -> (Array3<f32>, Array1<i64>) {
    let dim = features.first().map_or(0, Array2::ncols);
    let max_len = features.iter().map(Array2::nrows).max().unwrap_or(0);

    let mut batch = Array3::from_elem((features.len(), max_len, dim), pad_value);
    for (i, chunk) in features.iter().enumerate() {
        batch.slice_mut(s![i, ..chunk.nrows(), ..]).assign(chunk);
    }

    let lengths = features.iter().map(|chunk| chunk.nrows() as i64).collect();
    (batch, lengths)
}

/// Numerically stable log-softmax of one row.
pub fn log_softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    logits.mapv(|x| x - log_sum)
}

/// `ln(exp(a) + exp(b))`.
pub fn log_add(a: f32, b: f32) -> f32 {
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    if lo == f32::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Valid output length of stream `i`, bounded by the padded size.
pub(crate) fn output_length(lengths: &Array1<i64>, i: usize, padded: usize) -> usize {
    lengths
        .get(i)
        .map_or(0, |&len| (len.max(0) as usize).min(padded))
}

//! Per-utterance input and decode state.

use crate::audio::{MelConfig, MelFbank};
use crate::endpoint::EndpointDetector;
use crate::error::{PreconditionError, Result};
use crate::features::{FeatureBuffer, LOG_ZERO_PADDING};
use crate::types::DecodeMode;
use ndarray::{Array2, ArrayView2};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One audio stream bound to the recognizer that created it.
///
/// Input is pushed as audio or feature frames and consumed only by the
/// recognizer's decode calls. `T` is the decode state of the recognizer's
/// strategy.
#[derive(Debug)]
pub struct Stream<T> {
    id: u64,
    recognizer_id: u64,
    mode: DecodeMode,
    fbank: MelFbank,
    buffer: FeatureBuffer,
    pub(crate) state: T,
    pub(crate) endpoint: EndpointDetector,
    input_finished: bool,
    /// Frames pushed by the caller, excluding tail padding
    real_frames: usize,
    segment: usize,
    /// Input frame index where the current segment starts
    segment_start: usize,
}

impl<T> Stream<T> {
    pub(crate) fn new(
        recognizer_id: u64,
        mode: DecodeMode,
        mel: MelConfig,
        state: T,
        endpoint: EndpointDetector,
    ) -> Self {
        let buffer = FeatureBuffer::new(mel.n_mels);

        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            recognizer_id,
            mode,
            fbank: MelFbank::new(mel),
            buffer,
            state,
            endpoint,
            input_finished: false,
            real_frames: 0,
            segment: 0,
            segment_start: 0,
        }
    }

    /// Process-unique stream id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the recognizer that created this stream.
    pub fn recognizer_id(&self) -> u64 {
        self.recognizer_id
    }

    /// Push audio samples in `[-1, 1]` at `sample_rate`.
    ///
    /// Samples that do not yet fill a feature window are kept for the next
    /// call.
    pub fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]) -> Result<()> {
        self.check_open()?;

        let expected = self.fbank.config().sample_rate as u32;
        if sample_rate != expected {
            return Err(PreconditionError::SampleRateMismatch {
                expected,
                got: sample_rate,
            }
            .into());
        }

        let frames = self.fbank.accept(samples);
        self.push_frames(frames.view());
        Ok(())
    }

    /// Push precomputed feature frames `(frames, dim)`.
    pub fn accept_features(&mut self, frames: ArrayView2<f32>) -> Result<()> {
        self.check_open()?;

        if frames.ncols() != self.buffer.dim() {
            return Err(PreconditionError::FeatureDimMismatch {
                expected: self.buffer.dim(),
                got: frames.ncols(),
            }
            .into());
        }

        self.push_frames(frames);
        Ok(())
    }

    /// Signal that no more input will arrive.
    ///
    /// In streaming mode the final partial window is padded so every real
    /// frame is decoded exactly once. Calling this again has no effect.
    pub fn input_finished(&mut self) {
        if self.input_finished {
            return;
        }
        self.input_finished = true;

        if let DecodeMode::Streaming { window, shift } = self.mode {
            let padding = tail_padding(self.unconsumed_real_frames(), self.buffer.len(), window, shift);
            if padding > 0 {
                tracing::trace!(stream = self.id, padding, "padding final window");
                self.buffer.pad(padding, LOG_ZERO_PADDING);
            }
        }
    }

    pub fn is_input_finished(&self) -> bool {
        self.input_finished
    }

    /// Frames waiting to be decoded, including tail padding.
    pub fn num_pending_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Frames pushed so far, excluding padding.
    pub fn num_frames(&self) -> usize {
        self.real_frames
    }

    /// Index of the current segment; incremented by every reset.
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Start of the current segment in seconds.
    pub fn start_time(&self) -> f32 {
        self.segment_start as f32 * self.fbank.config().frame_shift_secs()
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn endpoint(&self) -> &EndpointDetector {
        &self.endpoint
    }

    fn check_open(&self) -> Result<()> {
        if self.input_finished {
            return Err(PreconditionError::InputAfterFinished { stream: self.id }.into());
        }
        Ok(())
    }

    fn push_frames(&mut self, frames: ArrayView2<f32>) {
        self.real_frames += frames.nrows();
        self.buffer.push(frames);
    }

    fn unconsumed_real_frames(&self) -> usize {
        self.real_frames.saturating_sub(self.buffer.num_consumed())
    }

    /// Whether the next decode call may consume input from this stream.
    pub(crate) fn is_ready(&self) -> bool {
        match self.mode {
            DecodeMode::Streaming { window, .. } => {
                let drained =
                    self.input_finished && self.buffer.num_consumed() >= self.real_frames;
                self.buffer.len() >= window && !drained
            }
            DecodeMode::Offline => self.input_finished && !self.buffer.is_empty(),
        }
    }

    /// Features for the next decode call, without consuming them.
    pub(crate) fn peek_input(&self) -> Option<Array2<f32>> {
        match self.mode {
            DecodeMode::Streaming { window, .. } => self.buffer.peek_ready(window),
            DecodeMode::Offline => Some(self.buffer.pending()),
        }
    }

    /// Consume what `peek_input` returned after a successful decode.
    pub(crate) fn commit_input(&mut self, state: T) {
        match self.mode {
            DecodeMode::Streaming { window, shift } => self.buffer.consume(shift.min(window)),
            DecodeMode::Offline => self.buffer.consume(self.buffer.len()),
        }
        self.state = state;
    }

    /// Start a new segment with a fresh decode state.
    pub(crate) fn start_segment(&mut self, state: T) {
        self.state = state;
        self.endpoint.reset();
        self.segment += 1;
        self.segment_start = self.buffer.num_consumed();
    }
}

/// Padding frames needed so the windows cover `real` unconsumed frames.
///
/// With `k = ceil(real / shift)` windows, the last one ends at
/// `(k - 1) * shift + window`.
fn tail_padding(real: usize, available: usize, window: usize, shift: usize) -> usize {
    if real == 0 || shift == 0 {
        return 0;
    }

    let windows = real.div_ceil(shift);
    let needed = (windows - 1) * shift + window;
    needed.saturating_sub(available)
}

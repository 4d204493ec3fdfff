//! Endpoint detection from trailing silence and utterance length.

use crate::config::EndpointConfig;
use crate::types::DecodeProgress;

/// Counters derived from a stream's decode progress, in output frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointState {
    /// Frames since the last emitted token (0 when no token yet)
    pub trailing_silence_since_last_token: usize,
    /// Frames since segment start while no token has been emitted
    pub trailing_silence_since_start: usize,
    /// Frames decoded in this segment
    pub utterance_length: usize,
    /// Whether any token was emitted in this segment
    pub has_tokens: bool,
}

impl EndpointState {
    /// Derive counters from decode progress.
    pub fn from_progress(progress: &DecodeProgress) -> Self {
        let frames = progress.frames_decoded;

        let (since_token, since_start) = match progress.last_token_frame {
            Some(frame) if progress.has_tokens => (frames.saturating_sub(frame + 1), 0),
            _ => (0, frames),
        };

        Self {
            trailing_silence_since_last_token: since_token,
            trailing_silence_since_start: since_start,
            utterance_length: frames,
            has_tokens: progress.has_tokens,
        }
    }
}

/// Endpoint thresholds converted to output frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameThresholds {
    rule1: usize,
    rule2: usize,
    rule3: usize,
}

/// Stateless endpoint evaluator bound to one stream.
///
/// There is a single "listening" state: endpoint is a query over the latest
/// counters, never a consumed transition. Resetting the stream after an
/// endpoint is the caller's job.
#[derive(Clone, Debug)]
pub struct EndpointDetector {
    thresholds: FrameThresholds,
    frame_shift_secs: f32,
    state: EndpointState,
}

impl EndpointDetector {
    pub fn new(config: &EndpointConfig, frame_shift_secs: f32) -> Self {
        let to_frames = |secs: f32| secs_to_frames(secs, frame_shift_secs);

        Self {
            thresholds: FrameThresholds {
                rule1: to_frames(config.rule1_min_trailing_silence),
                rule2: to_frames(config.rule2_min_trailing_silence),
                rule3: to_frames(config.rule3_min_utterance_length),
            },
            frame_shift_secs,
            state: EndpointState::default(),
        }
    }

    /// Refresh counters after a decode step.
    pub fn update(&mut self, progress: &DecodeProgress) {
        self.state = EndpointState::from_progress(progress);
    }

    /// Clear counters for a new segment.
    pub fn reset(&mut self) {
        self.state = EndpointState::default();
    }

    pub fn state(&self) -> &EndpointState {
        &self.state
    }

    /// Trailing silence after the last token in seconds.
    pub fn trailing_silence_secs(&self) -> f32 {
        self.state.trailing_silence_since_last_token as f32 * self.frame_shift_secs
    }

    /// Decoded utterance length in seconds.
    pub fn utterance_secs(&self) -> f32 {
        self.state.utterance_length as f32 * self.frame_shift_secs
    }

    pub fn is_endpoint(&self) -> bool {
        let state = &self.state;
        let rule1 = state.has_tokens
            && state.trailing_silence_since_last_token >= self.thresholds.rule1;
        let rule2 =
            !state.has_tokens && state.trailing_silence_since_start >= self.thresholds.rule2;
        let rule3 = state.utterance_length >= self.thresholds.rule3;

        if rule1 || rule2 || rule3 {
            tracing::trace!(rule1, rule2, rule3, ?state, "endpoint detected");
        }

        rule1 || rule2 || rule3
    }
}

/// Smallest frame count whose duration reaches `secs`.
///
/// A small tolerance absorbs float error so that e.g. 0.8s at 0.04s per
/// frame is 20 frames rather than 21.
fn secs_to_frames(secs: f32, frame_shift_secs: f32) -> usize {
    ((secs / frame_shift_secs) - 1e-3).ceil().max(1.0) as usize
}

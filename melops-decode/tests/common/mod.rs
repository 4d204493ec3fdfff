//! Deterministic in-process backends for integration tests.
//!
//! Feature frames are one-dimensional for the transducer and CTC mocks: the
//! value of a frame is the id of the token spoken in it, 0 meaning silence.

#![allow(dead_code)]

use melops_decode::decoding::{CtcDecoder, TransducerSearch, WhisperDecoder};
use melops_decode::detokenizer::SymbolTable;
use melops_decode::error::{BackendError, Result};
use melops_decode::models::{
    CtcModel, OutputAlignment, TransducerModel, WhisperMetadata, WhisperModel,
};
use melops_decode::{DecodeMode, DecodingMethod, EndpointConfig, RecognizerConfig, Recognizer};
use ndarray::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const VOCAB: usize = 4;

/// Output frame shift of the mocks, in seconds.
pub const FRAME_SHIFT: f32 = 0.1;

pub fn symbols() -> SymbolTable {
    SymbolTable::from_pieces(["<blk>", "▁a", "▁b", "c"])
}

/// Feature frames holding the given token ids.
pub fn frames(ids: &[usize]) -> Array2<f32> {
    Array2::from_shape_fn((ids.len(), 1), |(t, _)| ids[t] as f32)
}

pub fn config(method: DecodingMethod) -> RecognizerConfig {
    RecognizerConfig {
        decoding_method: method,
        enable_endpoint: true,
        endpoint_config: EndpointConfig {
            rule1_min_trailing_silence: 0.5,
            rule2_min_trailing_silence: 0.3,
            rule3_min_utterance_length: 1.0,
        },
        ..RecognizerConfig::default()
    }
}

/// Number of encoder outputs a window of `len` frames yields.
fn outputs_for(mode: DecodeMode, len: usize) -> usize {
    match mode {
        DecodeMode::Streaming { shift, .. } => len.min(shift),
        DecodeMode::Offline => len,
    }
}

/// Error shared by the failing backends.
fn injected_failure() -> melops_decode::Error {
    BackendError::External("injected failure".into()).into()
}

/// Encoder cache of [`MockTransducer`]: what a stream has been through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockEncoderState {
    /// Encoder calls that included the stream
    pub windows: usize,
    /// Output frames produced for the stream
    pub frames: usize,
}

/// Transducer whose encoder passes features through and whose joiner
/// emits the frame's token unless it equals the previous token.
#[derive(Clone, Debug)]
pub struct MockTransducer {
    pub mode: DecodeMode,
    pub fail: Arc<AtomicBool>,
}

impl MockTransducer {
    pub fn streaming(window: usize, shift: usize) -> Self {
        Self {
            mode: DecodeMode::Streaming { window, shift },
            fail: Arc::default(),
        }
    }
}

impl TransducerModel for MockTransducer {
    type EncoderState = MockEncoderState;

    fn mode(&self) -> DecodeMode {
        self.mode
    }

    fn feature_dim(&self) -> usize {
        1
    }

    fn frame_shift_secs(&self) -> f32 {
        FRAME_SHIFT
    }

    fn blank_id(&self) -> usize {
        0
    }

    fn context_size(&self) -> usize {
        1
    }

    fn init_encoder_state(&self) -> Self::EncoderState {
        MockEncoderState::default()
    }

    fn encode(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
        states: &[&Self::EncoderState],
    ) -> Result<(Array3<f32>, Array1<i64>, Vec<Self::EncoderState>)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let out_len = outputs_for(self.mode, features.dim().1);
        let encoder_out = features.slice(s![.., ..out_len, ..]).to_owned();
        let out_lengths = lengths.mapv(|len| (len as usize).min(out_len) as i64);

        let next = states
            .iter()
            .zip(&out_lengths)
            .map(|(state, &frames)| MockEncoderState {
                windows: state.windows + 1,
                frames: state.frames + frames as usize,
            })
            .collect();

        Ok((encoder_out, out_lengths, next))
    }

    fn run_decoder(&mut self, contexts: Array2<i64>) -> Result<Array2<f32>> {
        Ok(contexts.mapv(|id| id as f32))
    }

    fn run_joiner(
        &mut self,
        encoder_out: Array2<f32>,
        decoder_out: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let mut logits = Array2::<f32>::zeros((encoder_out.nrows(), VOCAB));

        for (r, mut row) in logits.rows_mut().into_iter().enumerate() {
            let target = encoder_out[[r, 0]] as usize;
            let previous = decoder_out[[r, 0]] as usize;

            if target == 0 || target == previous {
                row[0] = 5.0;
            } else {
                row[target] = 5.0;
                row[0] = 1.0;
            }
        }

        Ok(logits)
    }
}

/// CTC model whose scores are one-hot on the frame's token.
#[derive(Clone, Debug)]
pub struct MockCtc {
    pub mode: DecodeMode,
    pub alignment: OutputAlignment,
    pub fail: Arc<AtomicBool>,
}

impl MockCtc {
    pub fn offline() -> Self {
        Self {
            mode: DecodeMode::Offline,
            alignment: OutputAlignment::Frame,
            fail: Arc::default(),
        }
    }

    pub fn streaming(window: usize, shift: usize) -> Self {
        Self {
            mode: DecodeMode::Streaming { window, shift },
            ..Self::offline()
        }
    }
}

impl CtcModel for MockCtc {
    fn mode(&self) -> DecodeMode {
        self.mode
    }

    fn feature_dim(&self) -> usize {
        1
    }

    fn frame_shift_secs(&self) -> f32 {
        FRAME_SHIFT
    }

    fn blank_id(&self) -> usize {
        0
    }

    fn alignment(&self) -> OutputAlignment {
        self.alignment
    }

    fn forward(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array3<f32>, Array1<i64>)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let (batch, _, _) = features.dim();
        let out_len = outputs_for(self.mode, features.dim().1);

        let scores = Array3::from_shape_fn((batch, out_len, VOCAB), |(i, t, k)| {
            let id = (features[[i, t, 0]].max(0.0) as usize).min(VOCAB - 1);
            if k == id { 0.0 } else { -10.0 }
        });
        let out_lengths = lengths.mapv(|len| (len as usize).min(out_len) as i64);

        Ok((scores, out_lengths))
    }
}

/// Whisper model that never produces end-of-text unless told to.
///
/// Each generated token is `1 + (first feature value + position) % 3`, so
/// different utterances produce different text.
#[derive(Clone, Debug)]
pub struct MockWhisper {
    pub metadata: WhisperMetadata,
    /// Emit end-of-text once this many tokens were generated
    pub eot_after: Option<usize>,
    /// Encoder calls
    pub encodes: Arc<AtomicUsize>,
    /// Utterances encoded over all encoder calls
    pub encoded_rows: Arc<AtomicUsize>,
    /// Decoder steps
    pub steps: Arc<AtomicUsize>,
}

pub const WHISPER_SOT: i64 = 3;
pub const WHISPER_EOT: i64 = 0;

impl MockWhisper {
    pub fn new(n_text_ctx: usize, eot_after: Option<usize>) -> Self {
        Self {
            metadata: WhisperMetadata {
                n_text_layer: 2,
                n_text_ctx,
                n_text_state: 3,
                sot_sequence: vec![WHISPER_SOT],
                eot: WHISPER_EOT,
                no_timestamps: None,
            },
            eot_after,
            encodes: Arc::default(),
            encoded_rows: Arc::default(),
            steps: Arc::default(),
        }
    }
}

impl WhisperModel for MockWhisper {
    fn metadata(&self) -> &WhisperMetadata {
        &self.metadata
    }

    fn feature_dim(&self) -> usize {
        1
    }

    fn frame_shift_secs(&self) -> f32 {
        0.01
    }

    fn encode(
        &mut self,
        features: Array3<f32>,
        _lengths: Array1<i64>,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let (batch, frames, _) = features.dim();
        let layers = self.metadata.n_text_layer;
        self.encodes.fetch_add(1, Ordering::SeqCst);
        self.encoded_rows.fetch_add(batch, Ordering::SeqCst);
        let state = self.metadata.n_text_state;

        let cross = Array4::from_shape_fn((layers, batch, frames, state), |(_, i, _, _)| {
            features[[i, 0, 0]]
        });
        Ok((cross.clone(), cross))
    }

    fn decode(
        &mut self,
        tokens: Array2<i64>,
        self_k: ArrayView4<f32>,
        self_v: ArrayView4<f32>,
        cross_k: ArrayView4<f32>,
        _cross_v: ArrayView4<f32>,
        offset: usize,
    ) -> Result<(Array3<f32>, Array4<f32>, Array4<f32>)> {
        let fed = tokens.ncols();
        self.steps.fetch_add(1, Ordering::SeqCst);
        let generated = (offset + fed).saturating_sub(self.metadata.sot_sequence.len());
        let seed = cross_k[[0, 0, 0, 0]] as usize;

        let next = match self.eot_after {
            Some(limit) if generated >= limit => WHISPER_EOT as usize,
            _ => 1 + (seed + offset + fed) % 3,
        };

        let mut logits = Array3::<f32>::zeros((1, fed, VOCAB));
        logits[[0, fed - 1, next]] = 1.0;

        let mut keys = self_k.to_owned();
        let mut values = self_v.to_owned();
        keys.slice_mut(s![.., .., offset..offset + fed, ..]).fill(1.0);
        values.slice_mut(s![.., .., offset..offset + fed, ..]).fill(1.0);

        Ok((logits, keys, values))
    }
}

pub fn transducer_recognizer(
    model: MockTransducer,
    method: DecodingMethod,
) -> Recognizer<TransducerSearch<MockTransducer>> {
    let config = config(method);
    let search = TransducerSearch::new(model, &config);

    Recognizer::new(config, search, Box::new(symbols())).expect("valid config")
}

pub fn ctc_recognizer(model: MockCtc) -> Recognizer<CtcDecoder<MockCtc>> {
    Recognizer::new(
        config(DecodingMethod::GreedySearch),
        CtcDecoder::new(model),
        Box::new(symbols()),
    )
    .expect("valid config")
}

pub fn whisper_recognizer(model: MockWhisper) -> Recognizer<WhisperDecoder<MockWhisper>> {
    Recognizer::new(
        config(DecodingMethod::GreedySearch),
        WhisperDecoder::new(model),
        Box::new(symbols()),
    )
    .expect("valid config")
}

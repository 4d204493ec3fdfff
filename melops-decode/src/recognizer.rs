//! Stream scheduling: readiness, batching and result snapshots.

use crate::audio::MelConfig;
use crate::config::RecognizerConfig;
use crate::decoding::DecodingStrategy;
use crate::detokenizer::Detokenizer;
use crate::endpoint::EndpointDetector;
use crate::error::{BackendError, ConfigError, PreconditionError, Result};
use crate::result::RecognitionResult;
use crate::stream::Stream;
use crate::types::DecodeMode;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RECOGNIZER_ID: AtomicU64 = AtomicU64::new(1);

/// Owns a decoding strategy and drives the streams it creates.
///
/// The model family is fixed by `S`. Decode calls take `&mut self`, so one
/// recognizer runs one batch at a time; callers that want parallelism batch
/// their streams instead.
pub struct Recognizer<S: DecodingStrategy> {
    id: u64,
    strategy: S,
    detokenizer: Box<dyn Detokenizer>,
    config: RecognizerConfig,
    mel: MelConfig,
}

impl<S: DecodingStrategy> Recognizer<S> {
    /// Build a recognizer around a loaded strategy.
    ///
    /// The feature dimension always follows the model; a differing
    /// `feat_config.feature_dim` is overridden with a warning.
    pub fn new(
        config: RecognizerConfig,
        strategy: S,
        detokenizer: Box<dyn Detokenizer>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let feature_dim = strategy.feature_dim();
        if feature_dim != config.feat_config.feature_dim {
            tracing::warn!(
                configured = config.feat_config.feature_dim,
                model = feature_dim,
                "feature dimension taken from the model"
            );
        }

        if config.model_config.debug {
            tracing::info!(?config, mode = ?strategy.mode(), "recognizer config");
        }

        let mel = MelConfig::new(config.feat_config.sample_rate, feature_dim);
        let id = NEXT_RECOGNIZER_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            recognizer = id,
            feature_dim,
            vocab_size = detokenizer.vocab_size(),
            "recognizer ready"
        );

        Ok(Self {
            id,
            strategy,
            detokenizer,
            config,
            mel,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn mode(&self) -> DecodeMode {
        self.strategy.mode()
    }

    /// New stream with an empty buffer and a fresh decode state.
    pub fn create_stream(&self) -> Stream<S::State> {
        let endpoint =
            EndpointDetector::new(&self.config.endpoint_config, self.strategy.frame_shift_secs());
        let stream = Stream::new(
            self.id,
            self.strategy.mode(),
            self.mel.clone(),
            self.strategy.new_state(),
            endpoint,
        );

        tracing::debug!(recognizer = self.id, stream = stream.id(), "stream created");
        stream
    }

    /// Whether the next decode call would consume input from `stream`.
    pub fn is_ready(&self, stream: &Stream<S::State>) -> bool {
        stream.recognizer_id() == self.id && stream.is_ready()
    }

    /// Decode one ready stream.
    pub fn decode_one(&mut self, stream: &mut Stream<S::State>) -> Result<()> {
        self.decode_batch(&mut [stream])
    }

    /// Decode every stream of `streams` in one strategy call.
    ///
    /// All streams must belong to this recognizer and be ready. On error no
    /// stream is changed: decode states stay as they were and no input is
    /// consumed.
    pub fn decode_batch(&mut self, streams: &mut [&mut Stream<S::State>]) -> Result<()> {
        if streams.is_empty() {
            return Ok(());
        }

        let mut features = Vec::with_capacity(streams.len());
        for stream in streams.iter() {
            self.check_owned(stream)?;
            let chunk = if stream.is_ready() {
                stream.peek_input()
            } else {
                None
            };
            let chunk = chunk.ok_or(PreconditionError::NotReady {
                stream: stream.id(),
            })?;
            features.push(chunk);
        }

        let next = {
            let states: Vec<&S::State> = streams.iter().map(|stream| &stream.state).collect();
            self.strategy.decode(&features, &states)?
        };

        if next.len() != streams.len() {
            return Err(BackendError::ShapeMismatch {
                name: "decode states".to_string(),
                expected: vec![streams.len()],
                got: vec![next.len()],
            }
            .into());
        }

        for (stream, state) in streams.iter_mut().zip(next) {
            let progress = self.strategy.progress(&state);
            stream.commit_input(state);
            stream.endpoint.update(&progress);
        }

        tracing::debug!(
            recognizer = self.id,
            batch = streams.len(),
            frames = features.iter().map(|chunk| chunk.nrows()).sum::<usize>(),
            "batch decoded"
        );
        Ok(())
    }

    /// Decode all ready streams of `streams` as one batch.
    ///
    /// Returns the number of streams decoded.
    pub fn decode_ready(&mut self, streams: &mut [Stream<S::State>]) -> Result<usize> {
        let id = self.id;
        let mut ready: Vec<&mut Stream<S::State>> = streams
            .iter_mut()
            .filter(|stream| stream.recognizer_id() == id && stream.is_ready())
            .collect();

        self.decode_batch(&mut ready)?;
        Ok(ready.len())
    }

    /// Whether the stream reached an endpoint. Always false when endpoint
    /// detection is disabled.
    pub fn is_endpoint(&self, stream: &Stream<S::State>) -> bool {
        self.config.enable_endpoint
            && stream.recognizer_id() == self.id
            && stream.endpoint().is_endpoint()
    }

    /// Start a new segment: fresh decode state and endpoint counters.
    ///
    /// Unconsumed input stays in the buffer and belongs to the new segment.
    pub fn reset(&self, stream: &mut Stream<S::State>) -> Result<()> {
        self.check_owned(stream)?;
        stream.start_segment(self.strategy.new_state());

        tracing::debug!(stream = stream.id(), segment = stream.segment(), "stream reset");
        Ok(())
    }

    /// Snapshot of the current best transcript.
    pub fn result(&self, stream: &Stream<S::State>) -> RecognitionResult {
        let tokens = self.strategy.best(stream.state());
        let is_final = stream.is_input_finished() && !stream.is_ready();

        RecognitionResult::from_tokens(
            &tokens,
            self.detokenizer.as_ref(),
            self.strategy.frame_shift_secs(),
        )
        .with_segment(stream.segment(), stream.start_time(), is_final)
    }

    fn check_owned(&self, stream: &Stream<S::State>) -> Result<()> {
        if stream.recognizer_id() != self.id {
            return Err(PreconditionError::ForeignStream {
                stream: stream.id(),
                owner: stream.recognizer_id(),
                recognizer: self.id,
            }
            .into());
        }
        Ok(())
    }
}

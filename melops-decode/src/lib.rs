//! melops-decode: streaming and offline ASR decode orchestration.
//!
//! The crate sits between audio input and an inference backend. It owns the
//! stream lifecycle, batches ready streams into one backend call, runs the
//! per-family search and decides utterance boundaries.
//!
//! # Architecture
//!
//! - [`recognizer::Recognizer`]: creates streams, decides readiness, decodes
//!   batches and builds results. Generic over its decoding strategy.
//! - [`decoding::DecodingStrategy`]: one implementation per model family
//!   (transducer greedy/beam search, Whisper cache decoding, CTC arg-max).
//! - [`models`]: backend traits and their ONNX Runtime implementations.
//! - [`stream::Stream`]: feature buffer, decode state and endpoint counters of
//!   one utterance.
//!
//! # Quick Start
//!
//! ```ignore
//! use melops_decode::RecognizerConfig;
//! use melops_decode::pipelines::NemoCtcRecognizer;
//!
//! let mut config = RecognizerConfig::default();
//! config.model_config.nemo_ctc = Some("model.onnx".into());
//! config.model_config.tokens = "tokens.txt".into();
//!
//! let mut recognizer = NemoCtcRecognizer::from_config(config)?;
//! let mut stream = recognizer.create_stream();
//!
//! stream.accept_waveform(16000, &samples)?;
//! stream.input_finished();
//!
//! while recognizer.is_ready(&stream) {
//!     recognizer.decode_one(&mut stream)?;
//! }
//! println!("{}", recognizer.result(&stream).text);
//! ```

pub mod audio;
pub mod cache;
pub mod config;
pub mod decoding;
pub mod detokenizer;
pub mod endpoint;
pub mod error;
pub mod features;
pub mod models;
pub mod pipelines;
pub mod recognizer;
pub mod result;
pub mod stream;
pub mod types;

pub use config::{DecodingMethod, EndpointConfig, FeatureConfig, ModelConfig, RecognizerConfig};
pub use decoding::DecodingStrategy;
pub use error::{Error, Result};
pub use recognizer::Recognizer;
pub use result::RecognitionResult;
pub use stream::Stream;
pub use types::{DecodeMode, ModelRepo};

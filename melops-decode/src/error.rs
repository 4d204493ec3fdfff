//! Error types for melops-decode organized by failure class.
//!
//! Configuration errors surface when a recognizer is built, precondition
//! errors are caller contract violations, and backend errors come from the
//! inference engine. A failed decode never leaves a stream half-updated.

use ndarray::ShapeError;
use ndarray_stats::errors::MinMaxError;
use thiserror::Error;

/// Decode orchestration error variants organized by failure class.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or model loading error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Caller contract violation
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Inference backend error
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Configuration errors (model files, metadata, option values).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Model file not found
    #[error("model file not found: {0}")]
    ModelNotFound(String),

    /// No model family configured
    #[error("no model configured: set a transducer, whisper, paraformer or nemo-ctc model")]
    NoModel,

    /// More than one model family configured
    #[error("ambiguous model config: both {first} and {second} are set")]
    AmbiguousModel {
        first: &'static str,
        second: &'static str,
    },

    /// Model family does not match the requested recognizer
    #[error("model config describes a {configured} model, expected {expected}")]
    WrongModelFamily {
        expected: &'static str,
        configured: &'static str,
    },

    /// Required model metadata key is absent
    #[error("missing model metadata: {key}")]
    MissingMetadata { key: String },

    /// Model metadata value could not be parsed
    #[error("invalid model metadata {key}={value:?}")]
    InvalidMetadata { key: String, value: String },

    /// Model input the backend cannot feed
    #[error("unsupported model input {name}: {reason}")]
    UnsupportedModelInput { name: String, reason: &'static str },

    /// Decoding method name not recognized
    #[error("unknown decoding method: {0} (expected greedy_search or modified_beam_search)")]
    UnknownDecodingMethod(String),

    /// Beam width out of range
    #[error("invalid max active paths: {0} (minimum 1)")]
    InvalidMaxActivePaths(usize),

    /// Endpoint threshold must be positive and finite
    #[error("invalid endpoint rule {rule}: {value}s")]
    InvalidEndpointRule { rule: &'static str, value: f32 },

    /// Feature configuration is unusable
    #[error("invalid feature config: sample rate {sample_rate}Hz, dimension {feature_dim}")]
    InvalidFeatureConfig { sample_rate: u32, feature_dim: usize },

    /// Execution provider not compiled in
    #[error("unsupported execution provider: {0}")]
    UnsupportedProvider(String),

    /// Token table line could not be parsed
    #[error("invalid token table line {line}: {content:?}")]
    InvalidTokenLine { line: usize, content: String },

    /// Token table IO error
    #[error("failed to read token table: {0}")]
    TokenTable(#[from] std::io::Error),

    /// HuggingFace tokenizer failed to load
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(tokenizers::Error),

    /// Session creation failed
    #[error("failed to create inference session for {path}: {source}")]
    Session { path: String, source: ort::Error },
}

/// Caller contract violations.
#[derive(Debug, Error)]
pub enum PreconditionError {
    /// Decode requested on a stream without ready input
    #[error("stream {stream} has no ready input")]
    NotReady { stream: u64 },

    /// Stream was created by a different recognizer
    #[error("stream {stream} belongs to recognizer {owner}, not {recognizer}")]
    ForeignStream {
        stream: u64,
        owner: u64,
        recognizer: u64,
    },

    /// Autoregressive cache would be written past its capacity
    #[error("context overflow: offset {offset} + {requested} tokens exceeds capacity {capacity}")]
    ContextOverflow {
        offset: usize,
        requested: usize,
        capacity: usize,
    },

    /// Autoregressive decode already produced end-of-text
    #[error("decode already finished")]
    DecodeFinished,

    /// Decoder stepped before the utterance was encoded
    #[error("utterance not encoded yet")]
    NotEncoded,

    /// Audio sample rate differs from the configured rate
    #[error("invalid sample rate: expected {expected}Hz, got {got}Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    /// Feature frames have the wrong dimension
    #[error("invalid feature dimension: expected {expected}, got {got}")]
    FeatureDimMismatch { expected: usize, got: usize },

    /// Input pushed after input_finished
    #[error("stream {stream} already received input_finished")]
    InputAfterFinished { stream: u64 },
}

/// Inference backend errors (ONNX, ndarray operations).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Missing expected output tensor
    #[error("missing model output: {name}")]
    MissingOutput { name: String },

    /// Output tensor shape differs from the model contract
    #[error("unexpected shape for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Error reported by a non-ONNX backend
    #[error("backend failure: {0}")]
    External(Box<dyn std::error::Error + Send + Sync>),

    /// ONNX Runtime error
    #[error(transparent)]
    Ort(#[from] ort::Error),

    /// ndarray shape error
    #[error(transparent)]
    Shape(#[from] ShapeError),

    /// ndarray-stats min/max error
    #[error(transparent)]
    MinMax(#[from] MinMaxError),
}

/// Result type alias for melops-decode operations.
pub type Result<T> = std::result::Result<T, Error>;

// Nested From implementations for automatic error conversion chains

// ort::Error → BackendError → Error
impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::Backend(BackendError::Ort(e))
    }
}

// ShapeError → BackendError → Error
impl From<ShapeError> for Error {
    fn from(e: ShapeError) -> Self {
        Error::Backend(BackendError::Shape(e))
    }
}

// MinMaxError → BackendError → Error
impl From<MinMaxError> for Error {
    fn from(e: MinMaxError) -> Self {
        Error::Backend(BackendError::MinMax(e))
    }
}

// std::io::Error → ConfigError → Error
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(ConfigError::TokenTable(e))
    }
}

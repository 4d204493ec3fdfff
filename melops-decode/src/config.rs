//! Recognizer configuration record.
//!
//! Every struct derives [`clap::Args`] so a binary can flatten it straight
//! into its command line; defaults match the reference C API.

use crate::error::ConfigError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default sample rate in Hz
const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default feature dimension (mel bins)
const DEFAULT_FEATURE_DIM: usize = 80;

/// Default beam width for modified beam search
const DEFAULT_MAX_ACTIVE_PATHS: usize = 4;

const DEFAULT_RULE1_MIN_TRAILING_SILENCE: f32 = 2.4;
const DEFAULT_RULE2_MIN_TRAILING_SILENCE: f32 = 1.2;
const DEFAULT_RULE3_MIN_UTTERANCE_LENGTH: f32 = 20.0;

/// Feature extraction settings shared by every stream of a recognizer.
#[derive(clap::Args, Clone, Debug, PartialEq)]
pub struct FeatureConfig {
    /// Expected audio sample rate in Hz
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Feature frame dimension
    #[arg(long, default_value_t = DEFAULT_FEATURE_DIM)]
    pub feature_dim: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            feature_dim: DEFAULT_FEATURE_DIM,
        }
    }
}

/// Model files and inference session settings.
///
/// Exactly one model family must be configured: a transducer (encoder,
/// decoder and joiner), a Whisper encoder/decoder pair, a Paraformer model or
/// a NeMo CTC model.
#[derive(clap::Args, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    /// Transducer encoder model
    #[arg(long)]
    pub encoder: Option<PathBuf>,

    /// Transducer decoder model
    #[arg(long)]
    pub decoder: Option<PathBuf>,

    /// Transducer joiner model
    #[arg(long)]
    pub joiner: Option<PathBuf>,

    /// Whisper encoder model
    #[arg(long)]
    pub whisper_encoder: Option<PathBuf>,

    /// Whisper decoder model
    #[arg(long)]
    pub whisper_decoder: Option<PathBuf>,

    /// Paraformer model
    #[arg(long)]
    pub paraformer: Option<PathBuf>,

    /// NeMo CTC model
    #[arg(long)]
    pub nemo_ctc: Option<PathBuf>,

    /// Token table (tokens.txt)
    #[arg(long, default_value = "tokens.txt")]
    pub tokens: PathBuf,

    /// Intra-op threads per inference session
    #[arg(long, default_value_t = 1)]
    pub num_threads: usize,

    /// Execution provider (cpu, cuda, tensorrt, openvino, directml, coreml)
    #[arg(long, default_value = "cpu")]
    pub provider: String,

    /// Log configuration and model metadata
    #[arg(long)]
    pub debug: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder: None,
            decoder: None,
            joiner: None,
            whisper_encoder: None,
            whisper_decoder: None,
            paraformer: None,
            nemo_ctc: None,
            tokens: PathBuf::from("tokens.txt"),
            num_threads: 1,
            provider: "cpu".to_string(),
            debug: false,
        }
    }
}

/// Model families a configuration can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    Transducer,
    Whisper,
    Paraformer,
    NemoCtc,
}

impl ModelFamily {
    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::Transducer => "transducer",
            ModelFamily::Whisper => "whisper",
            ModelFamily::Paraformer => "paraformer",
            ModelFamily::NemoCtc => "nemo-ctc",
        }
    }
}

impl ModelConfig {
    /// Determine which model family is configured.
    ///
    /// A family counts as configured when any of its files is set; a
    /// partially configured family is reported later as a missing file.
    pub fn family(&self) -> Result<ModelFamily, ConfigError> {
        let candidates = [
            (
                ModelFamily::Transducer,
                self.encoder.is_some() || self.decoder.is_some() || self.joiner.is_some(),
            ),
            (
                ModelFamily::Whisper,
                self.whisper_encoder.is_some() || self.whisper_decoder.is_some(),
            ),
            (ModelFamily::Paraformer, self.paraformer.is_some()),
            (ModelFamily::NemoCtc, self.nemo_ctc.is_some()),
        ];

        let mut configured = candidates
            .iter()
            .filter(|(_, set)| *set)
            .map(|(family, _)| *family);

        let first = configured.next().ok_or(ConfigError::NoModel)?;

        match configured.next() {
            Some(second) => Err(ConfigError::AmbiguousModel {
                first: first.name(),
                second: second.name(),
            }),
            None => Ok(first),
        }
    }

    /// Check that the configured family is the expected one.
    pub fn expect_family(&self, expected: ModelFamily) -> Result<(), ConfigError> {
        let configured = self.family()?;

        if configured != expected {
            return Err(ConfigError::WrongModelFamily {
                expected: expected.name(),
                configured: configured.name(),
            });
        }

        Ok(())
    }
}

/// Transducer search algorithm.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum DecodingMethod {
    /// Single best path, one symbol per frame
    #[default]
    GreedySearch,
    /// Beam of `max_active_paths` hypotheses, one symbol per frame
    ModifiedBeamSearch,
}

impl DecodingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DecodingMethod::GreedySearch => "greedy_search",
            DecodingMethod::ModifiedBeamSearch => "modified_beam_search",
        }
    }
}

impl fmt::Display for DecodingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecodingMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy_search" => Ok(DecodingMethod::GreedySearch),
            "modified_beam_search" => Ok(DecodingMethod::ModifiedBeamSearch),
            other => Err(ConfigError::UnknownDecodingMethod(other.to_string())),
        }
    }
}

/// Endpoint thresholds in seconds.
#[derive(clap::Args, Clone, Copy, Debug, PartialEq)]
pub struct EndpointConfig {
    /// Trailing silence after the last token that ends an utterance
    ///
    /// The 2.4s default is the longer of the two silence rules: after speech
    /// an utterance ends later than before any token is seen.
    #[arg(long, default_value_t = DEFAULT_RULE1_MIN_TRAILING_SILENCE)]
    pub rule1_min_trailing_silence: f32,

    /// Trailing silence that ends an utterance with no tokens yet
    ///
    /// Defaults to 1.2s, shorter than rule 1.
    #[arg(long, default_value_t = DEFAULT_RULE2_MIN_TRAILING_SILENCE)]
    pub rule2_min_trailing_silence: f32,

    /// Utterance length that always ends an utterance
    #[arg(long, default_value_t = DEFAULT_RULE3_MIN_UTTERANCE_LENGTH)]
    pub rule3_min_utterance_length: f32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rule1_min_trailing_silence: DEFAULT_RULE1_MIN_TRAILING_SILENCE,
            rule2_min_trailing_silence: DEFAULT_RULE2_MIN_TRAILING_SILENCE,
            rule3_min_utterance_length: DEFAULT_RULE3_MIN_UTTERANCE_LENGTH,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rules = [
            ("rule1", self.rule1_min_trailing_silence),
            ("rule2", self.rule2_min_trailing_silence),
            ("rule3", self.rule3_min_utterance_length),
        ];

        for (rule, value) in rules {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidEndpointRule { rule, value });
            }
        }

        Ok(())
    }
}

/// Complete recognizer configuration.
#[derive(clap::Args, Clone, Debug, Default, PartialEq)]
pub struct RecognizerConfig {
    #[command(flatten)]
    pub feat_config: FeatureConfig,

    #[command(flatten)]
    pub model_config: ModelConfig,

    /// Transducer search algorithm
    #[arg(long, value_enum, default_value_t = DecodingMethod::GreedySearch)]
    pub decoding_method: DecodingMethod,

    /// Beam width for modified beam search
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE_PATHS)]
    pub max_active_paths: usize,

    /// Report endpoints from is_endpoint
    #[arg(long)]
    pub enable_endpoint: bool,

    #[command(flatten)]
    pub endpoint_config: EndpointConfig,
}

impl RecognizerConfig {
    /// Validate option values before any model is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feat_config.sample_rate == 0 || self.feat_config.feature_dim == 0 {
            return Err(ConfigError::InvalidFeatureConfig {
                sample_rate: self.feat_config.sample_rate,
                feature_dim: self.feat_config.feature_dim,
            });
        }

        if self.max_active_paths == 0 {
            return Err(ConfigError::InvalidMaxActivePaths(self.max_active_paths));
        }

        self.endpoint_config.validate()
    }

    /// Beam width actually used by the configured decoding method.
    pub fn beam_width(&self) -> usize {
        match self.decoding_method {
            DecodingMethod::GreedySearch => 1,
            DecodingMethod::ModifiedBeamSearch => self.max_active_paths.max(1),
        }
    }
}

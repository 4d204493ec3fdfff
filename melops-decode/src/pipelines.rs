//! Ready-made recognizers over the ONNX backends.

use crate::config::{ModelFamily, RecognizerConfig};
use crate::decoding::{CtcDecoder, TransducerSearch, WhisperDecoder};
use crate::detokenizer::{Detokenizer, SymbolTable, load_tokenizer};
use crate::error::ConfigError;
use crate::models::{
    OnnxNemoCtc, OnnxParaformer, OnnxStreamingTransducer, OnnxTransducer, OnnxWhisper,
};
use crate::recognizer::Recognizer;
use crate::types::ModelRepo;

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Offline transducer recognizer (icefall encoder/decoder/joiner export).
pub type TransducerRecognizer = Recognizer<TransducerSearch<OnnxTransducer>>;

/// Streaming transducer recognizer (icefall streaming zipformer export).
pub type StreamingTransducerRecognizer = Recognizer<TransducerSearch<OnnxStreamingTransducer>>;

/// Whisper encoder/decoder recognizer with a self-attention cache.
pub type WhisperRecognizer = Recognizer<WhisperDecoder<OnnxWhisper>>;

/// NeMo CTC recognizer.
pub type NemoCtcRecognizer = Recognizer<CtcDecoder<OnnxNemoCtc>>;

/// Paraformer recognizer.
pub type ParaformerRecognizer = Recognizer<CtcDecoder<OnnxParaformer>>;

/// Load the token table named by `model_config.tokens`.
///
/// A `.json` file is read as a HuggingFace tokenizer; anything else as a
/// `tokens.txt` symbol table, base64 decoded when `base64` is set.
fn load_detokenizer(
    repo: &ModelRepo,
    config: &RecognizerConfig,
    base64: bool,
) -> ConfigResult<Box<dyn Detokenizer>> {
    let path = repo.resolve(&config.model_config.tokens)?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        return Ok(Box::new(load_tokenizer(&path)?));
    }

    let table = if base64 {
        SymbolTable::load_base64(&path)?
    } else {
        SymbolTable::load(&path)?
    };
    Ok(Box::new(table))
}

impl TransducerRecognizer {
    /// Load a transducer recognizer from a model repository.
    ///
    /// # Arguments
    ///
    /// * `repo` - Model repository (local path, HF cache, or HF API)
    /// * `config` - Recognizer configuration naming the encoder, decoder and joiner
    pub fn from_repo(repo: &ModelRepo, config: RecognizerConfig) -> ConfigResult<Self> {
        config.validate()?;
        config.model_config.expect_family(ModelFamily::Transducer)?;

        let model = OnnxTransducer::from_repo(repo, &config.model_config, &config.feat_config)?;
        let search = TransducerSearch::new(model, &config);
        let detokenizer = load_detokenizer(repo, &config, false)?;

        Recognizer::new(config, search, detokenizer)
    }

    /// Load with model paths relative to the working directory.
    pub fn from_config(config: RecognizerConfig) -> ConfigResult<Self> {
        Self::from_repo(&ModelRepo::cwd(), config)
    }
}

impl StreamingTransducerRecognizer {
    /// Load a streaming transducer recognizer from a model repository.
    ///
    /// Window and shift come from the encoder's `T` and `decode_chunk_len`
    /// metadata; an offline encoder fails with missing metadata.
    pub fn from_repo(repo: &ModelRepo, config: RecognizerConfig) -> ConfigResult<Self> {
        config.validate()?;
        config.model_config.expect_family(ModelFamily::Transducer)?;

        let model =
            OnnxStreamingTransducer::from_repo(repo, &config.model_config, &config.feat_config)?;
        let search = TransducerSearch::new(model, &config);
        let detokenizer = load_detokenizer(repo, &config, false)?;

        Recognizer::new(config, search, detokenizer)
    }

    pub fn from_config(config: RecognizerConfig) -> ConfigResult<Self> {
        Self::from_repo(&ModelRepo::cwd(), config)
    }
}

impl WhisperRecognizer {
    /// Load a Whisper recognizer from a model repository.
    ///
    /// Whisper token tables store base64 encoded byte pieces.
    pub fn from_repo(repo: &ModelRepo, config: RecognizerConfig) -> ConfigResult<Self> {
        config.validate()?;
        config.model_config.expect_family(ModelFamily::Whisper)?;

        let model = OnnxWhisper::from_repo(repo, &config.model_config, &config.feat_config)?;
        let detokenizer = load_detokenizer(repo, &config, true)?;

        Recognizer::new(config, WhisperDecoder::new(model), detokenizer)
    }

    pub fn from_config(config: RecognizerConfig) -> ConfigResult<Self> {
        Self::from_repo(&ModelRepo::cwd(), config)
    }
}

impl NemoCtcRecognizer {
    /// Load a NeMo CTC recognizer from a model repository.
    pub fn from_repo(repo: &ModelRepo, config: RecognizerConfig) -> ConfigResult<Self> {
        config.validate()?;
        config.model_config.expect_family(ModelFamily::NemoCtc)?;

        let model = OnnxNemoCtc::from_repo(repo, &config.model_config, &config.feat_config)?;
        let detokenizer = load_detokenizer(repo, &config, false)?;

        Recognizer::new(config, CtcDecoder::new(model), detokenizer)
    }

    pub fn from_config(config: RecognizerConfig) -> ConfigResult<Self> {
        Self::from_repo(&ModelRepo::cwd(), config)
    }
}

impl ParaformerRecognizer {
    /// Load a Paraformer recognizer from a model repository.
    pub fn from_repo(repo: &ModelRepo, config: RecognizerConfig) -> ConfigResult<Self> {
        config.validate()?;
        config.model_config.expect_family(ModelFamily::Paraformer)?;

        let model = OnnxParaformer::from_repo(repo, &config.model_config, &config.feat_config)?;
        let detokenizer = load_detokenizer(repo, &config, false)?;

        Recognizer::new(config, CtcDecoder::new(model), detokenizer)
    }

    pub fn from_config(config: RecognizerConfig) -> ConfigResult<Self> {
        Self::from_repo(&ModelRepo::cwd(), config)
    }
}

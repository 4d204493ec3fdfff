//! Core types shared across recognizer families.

use crate::error::ConfigError;
use hf_hub::CacheRepo;
use hf_hub::api::sync::ApiRepo;
use std::path::{Path, PathBuf};

/// Model repository sources.
#[derive(Debug)]
pub enum ModelRepo {
    /// Local filesystem path
    Path(PathBuf),
    /// HuggingFace cache repository
    Cache(CacheRepo),
    /// HuggingFace API repository
    Api(ApiRepo),
}

impl ModelRepo {
    /// Repository rooted at the current directory.
    ///
    /// Absolute file names resolve to themselves, relative ones against the
    /// working directory.
    pub fn cwd() -> Self {
        ModelRepo::Path(PathBuf::new())
    }

    /// Resolve a file name to its full path in this repository.
    pub fn resolve(&self, file_name: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
        let file_name = file_name.as_ref();
        let not_found = || ConfigError::ModelNotFound(file_name.display().to_string());

        match self {
            ModelRepo::Path(path) => path.join(file_name).canonicalize().map_err(|e| {
                tracing::debug!(file = %file_name.display(), error = %e, "model file lookup failed");
                not_found()
            }),
            ModelRepo::Cache(cache_repo) => {
                let name = file_name.to_str().ok_or_else(not_found)?;
                cache_repo.get(name).ok_or_else(not_found)
            }
            ModelRepo::Api(api_repo) => {
                let name = file_name.to_str().ok_or_else(not_found)?;
                api_repo.get(name).map_err(|e| {
                    tracing::debug!(file = name, error = %e, "model download failed");
                    not_found()
                })
            }
        }
    }

    /// Resolve an optional configured file, reporting `what` when it is unset.
    pub fn resolve_required(
        &self,
        file_name: Option<&PathBuf>,
        what: &str,
    ) -> Result<PathBuf, ConfigError> {
        let file_name =
            file_name.ok_or_else(|| ConfigError::ModelNotFound(format!("{what} (not configured)")))?;
        self.resolve(file_name)
    }
}

/// Streaming or offline input consumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeMode {
    /// Fixed overlapping windows: `window` frames per decode, advancing by `shift`
    Streaming { window: usize, shift: usize },
    /// Whole utterance after input is finished
    Offline,
}

/// A decoded token id with its output frame, when the model is frame aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedToken {
    pub id: usize,
    pub frame: Option<usize>,
}

impl DecodedToken {
    pub fn new(id: usize, frame: Option<usize>) -> Self {
        Self { id, frame }
    }
}

/// How far a stream's decode state has advanced within the current segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeProgress {
    /// Output frames folded into the decode state
    pub frames_decoded: usize,
    /// Output frame of the most recent non-blank token
    pub last_token_frame: Option<usize>,
    /// Whether any token has been emitted
    pub has_tokens: bool,
}

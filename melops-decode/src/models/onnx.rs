//! ONNX Runtime session setup and tensor helpers shared by the backends.

use crate::config::ModelConfig;
use crate::error::{BackendError, ConfigError, Result};
use ndarray::{Array, ArrayD, Dimension};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use ort::value::DynValue;
use std::path::Path;
use std::str::FromStr;

#[cfg(feature = "coreml")]
use ort::execution_providers::CoreMLExecutionProvider;
#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;
#[cfg(feature = "directml")]
use ort::execution_providers::DirectMLExecutionProvider;
#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

/// Execution provider named by the configuration.
///
/// Providers other than `cpu` are only available when the matching cargo
/// feature is enabled.
fn execution_provider(name: &str) -> std::result::Result<ExecutionProviderDispatch, ConfigError> {
    let provider = match name {
        "cpu" => CPUExecutionProvider::default().build(),
        #[cfg(feature = "cuda")]
        "cuda" => CUDAExecutionProvider::default().build(),
        #[cfg(feature = "tensorrt")]
        "tensorrt" => TensorRTExecutionProvider::default().build(),
        #[cfg(feature = "openvino")]
        "openvino" => OpenVINOExecutionProvider::default()
            .with_device_type("GPU")
            .build(),
        #[cfg(feature = "directml")]
        "directml" => DirectMLExecutionProvider::default().build(),
        #[cfg(feature = "coreml")]
        "coreml" => CoreMLExecutionProvider::default().build(),
        other => return Err(ConfigError::UnsupportedProvider(other.to_string())),
    };
    Ok(provider)
}

/// Session builder with thread count and execution provider from the config.
pub fn session_builder(config: &ModelConfig) -> std::result::Result<SessionBuilder, ConfigError> {
    let provider = execution_provider(&config.provider)?;

    let session_error = |source| ConfigError::Session {
        path: format!("<session options: provider={}>", config.provider),
        source,
    };

    Session::builder()
        .and_then(|builder| builder.with_intra_threads(config.num_threads.max(1)))
        .and_then(|builder| builder.with_execution_providers([provider]))
        .map_err(session_error)
}

/// Commit a session from a model file.
pub fn load_session(
    builder: &SessionBuilder,
    path: &Path,
    debug: bool,
) -> std::result::Result<Session, ConfigError> {
    let session = builder
        .clone()
        .commit_from_file(path)
        .map_err(|source| ConfigError::Session {
            path: path.display().to_string(),
            source,
        })?;

    tracing::info!(path = %path.display(), "loaded model session");

    if debug {
        for input in &session.inputs {
            tracing::info!(name = %input.name, ty = ?input.input_type, "model input");
        }
        for output in &session.outputs {
            tracing::info!(name = %output.name, ty = ?output.output_type, "model output");
        }
    }

    Ok(session)
}

/// Raw custom metadata value.
pub fn metadata_raw(
    session: &Session,
    key: &str,
) -> std::result::Result<Option<String>, ConfigError> {
    let session_error = |source| ConfigError::Session {
        path: format!("<metadata {key}>"),
        source,
    };

    session
        .metadata()
        .and_then(|meta| meta.custom(key))
        .map_err(session_error)
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> std::result::Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidMetadata {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Required metadata value.
pub fn metadata_value<T: FromStr>(
    session: &Session,
    key: &str,
) -> std::result::Result<T, ConfigError> {
    let value = metadata_raw(session, key)?.ok_or_else(|| ConfigError::MissingMetadata {
        key: key.to_string(),
    })?;
    parse_value(key, &value)
}

/// Optional metadata value, parsed when present.
pub fn metadata_opt<T: FromStr>(
    session: &Session,
    key: &str,
) -> std::result::Result<Option<T>, ConfigError> {
    metadata_raw(session, key)?
        .map(|value| parse_value(key, &value))
        .transpose()
}

/// Required comma-separated metadata list.
pub fn metadata_list<T: FromStr>(
    session: &Session,
    key: &str,
) -> std::result::Result<Vec<T>, ConfigError> {
    let value = metadata_raw(session, key)?.ok_or_else(|| ConfigError::MissingMetadata {
        key: key.to_string(),
    })?;

    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_value(key, item))
        .collect()
}

/// Error for an output the model did not produce.
pub fn missing_output(name: &str) -> BackendError {
    BackendError::MissingOutput {
        name: name.to_string(),
    }
}

/// Extract an owned f32 array of fixed dimensionality.
pub fn extract_f32<D: Dimension>(value: &DynValue) -> Result<Array<f32, D>> {
    let array: ArrayD<f32> = value.try_extract_array::<f32>()?.to_owned();
    Ok(array.into_dimensionality::<D>()?)
}

/// Extract an owned i64 array of fixed dimensionality.
pub fn extract_i64<D: Dimension>(value: &DynValue) -> Result<Array<i64, D>> {
    let array: ArrayD<i64> = value.try_extract_array::<i64>()?.to_owned();
    Ok(array.into_dimensionality::<D>()?)
}

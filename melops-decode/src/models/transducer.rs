//! ONNX transducer backends (icefall exports).
//!
//! Both variants share the stateless decoder and the joiner; they differ in
//! the encoder. The offline encoder sees a whole utterance. The streaming
//! encoder sees one window at a time and threads its attention and
//! convolution caches through [`EncoderCache`].

use crate::config::{FeatureConfig, ModelConfig};
use crate::error::{BackendError, ConfigError, Result};
use crate::models::TransducerModel;
use crate::models::onnx::{
    extract_f32, extract_i64, load_session, metadata_opt, metadata_value, missing_output,
    session_builder,
};
use crate::types::{DecodeMode, ModelRepo};
use ndarray::prelude::*;
use ndarray::{Slice, concatenate};
use ort::inputs;
use ort::session::{Session, SessionInputs};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor};
use std::path::PathBuf;

/// Encoder output frame shift in seconds (4x subsampling of 10ms frames).
const FRAME_SHIFT_SECS: f32 = 0.04;

/// Decoder context size used when the decoder carries no metadata.
const DEFAULT_CONTEXT_SIZE: usize = 2;

/// Prefixes of the output that carries a cache input to the next window.
const CACHE_OUTPUT_PREFIXES: [&str; 2] = ["new_", "next_"];

/// Stateless decoder `y` to `decoder_out` and joiner `encoder_out`,
/// `decoder_out` to `logit`.
struct Prediction {
    decoder: Session,
    joiner: Session,
    context_size: usize,
}

impl Prediction {
    fn load(
        repo: &ModelRepo,
        config: &ModelConfig,
    ) -> std::result::Result<(Self, PathBuf), ConfigError> {
        let encoder_path = repo.resolve_required(config.encoder.as_ref(), "encoder")?;
        let decoder_path = repo.resolve_required(config.decoder.as_ref(), "decoder")?;
        let joiner_path = repo.resolve_required(config.joiner.as_ref(), "joiner")?;

        let builder = session_builder(config)?;
        let decoder = load_session(&builder, &decoder_path, config.debug)?;
        let joiner = load_session(&builder, &joiner_path, config.debug)?;

        let context_size =
            metadata_opt::<usize>(&decoder, "context_size")?.unwrap_or(DEFAULT_CONTEXT_SIZE);

        let prediction = Self {
            decoder,
            joiner,
            context_size,
        };
        Ok((prediction, encoder_path))
    }

    fn run_decoder(&mut self, contexts: Array2<i64>) -> Result<Array2<f32>> {
        let y = Tensor::from_array(contexts)?;

        let mut outputs = self.decoder.run(inputs!("y" => y))?;

        let decoder_out = outputs
            .remove("decoder_out")
            .ok_or_else(|| missing_output("decoder_out"))?;

        // Some exports keep a singleton time axis
        let decoder_out = extract_f32::<IxDyn>(&decoder_out)?;
        let rows = decoder_out.shape().first().copied().unwrap_or(0);
        let hidden = decoder_out.len() / rows.max(1);

        Ok(decoder_out.into_shape_with_order((rows, hidden))?)
    }

    fn run_joiner(
        &mut self,
        encoder_out: Array2<f32>,
        decoder_out: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let encoder_out = Tensor::from_array(encoder_out)?;
        let decoder_out = Tensor::from_array(decoder_out)?;

        let mut outputs = self.joiner.run(inputs!(
            "encoder_out" => encoder_out,
            "decoder_out" => decoder_out,
        ))?;

        let logit = outputs
            .remove("logit")
            .ok_or_else(|| missing_output("logit"))?;

        extract_f32::<Ix2>(&logit)
    }
}

/// Offline transducer: encoder, stateless decoder and joiner sessions.
///
/// Encoder I/O is `x`, `x_lens` to `encoder_out`, `encoder_out_lens`.
pub struct OnnxTransducer {
    encoder: Session,
    prediction: Prediction,
    feature_dim: usize,
}

impl OnnxTransducer {
    /// Load the three sessions named in `config` from a model repository.
    pub fn from_repo(
        repo: &ModelRepo,
        config: &ModelConfig,
        features: &FeatureConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let (prediction, encoder_path) = Prediction::load(repo, config)?;
        let encoder = load_session(&session_builder(config)?, &encoder_path, config.debug)?;

        tracing::info!(context_size = prediction.context_size, "transducer model loaded");

        Ok(Self {
            encoder,
            prediction,
            feature_dim: features.feature_dim,
        })
    }
}

impl TransducerModel for OnnxTransducer {
    type EncoderState = ();

    fn mode(&self) -> DecodeMode {
        DecodeMode::Offline
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn frame_shift_secs(&self) -> f32 {
        FRAME_SHIFT_SECS
    }

    fn blank_id(&self) -> usize {
        0
    }

    fn context_size(&self) -> usize {
        self.prediction.context_size
    }

    fn init_encoder_state(&self) -> Self::EncoderState {}

    fn encode(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
        states: &[&Self::EncoderState],
    ) -> Result<(Array3<f32>, Array1<i64>, Vec<Self::EncoderState>)> {
        let x = Tensor::from_array(features)?;
        let x_lens = Tensor::from_array(lengths)?;

        let mut outputs = self.encoder.run(inputs!(
            "x" => x,
            "x_lens" => x_lens,
        ))?;

        let encoder_out = outputs
            .remove("encoder_out")
            .ok_or_else(|| missing_output("encoder_out"))?;
        let encoder_out_lens = outputs
            .remove("encoder_out_lens")
            .ok_or_else(|| missing_output("encoder_out_lens"))?;

        let encoder_out = extract_f32::<Ix3>(&encoder_out)?;
        let encoder_out_lens = extract_i64::<Ix1>(&encoder_out_lens)?;

        tracing::debug!(shape = ?encoder_out.shape(), "encoder forward");

        Ok((encoder_out, encoder_out_lens, vec![(); states.len()]))
    }

    fn run_decoder(&mut self, contexts: Array2<i64>) -> Result<Array2<f32>> {
        self.prediction.run_decoder(contexts)
    }

    fn run_joiner(
        &mut self,
        encoder_out: Array2<f32>,
        decoder_out: Array2<f32>,
    ) -> Result<Array2<f32>> {
        self.prediction.run_joiner(encoder_out, decoder_out)
    }
}

/// One cached encoder tensor of a single stream (batch axis of size one).
#[derive(Clone, Debug, PartialEq)]
pub enum CacheTensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl CacheTensor {
    fn into_value(self) -> Result<DynValue> {
        Ok(match self {
            CacheTensor::F32(array) => Tensor::from_array(array)?.into_dyn(),
            CacheTensor::I64(array) => Tensor::from_array(array)?.into_dyn(),
        })
    }
}

/// Encoder caches of one stream, in the order of [`CacheSpec`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncoderCache {
    tensors: Vec<CacheTensor>,
}

impl EncoderCache {
    pub fn tensors(&self) -> &[CacheTensor] {
        &self.tensors
    }
}

/// Element type of a cache tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheType {
    F32,
    I64,
}

/// A cache input of the streaming encoder and the output that updates it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSpec {
    pub input: String,
    pub output: String,
    /// Axis holding the batch; the only dynamic axis of the declared shape
    pub batch_axis: usize,
    /// Shape for a single stream
    pub shape: Vec<usize>,
    pub ty: CacheType,
}

impl CacheSpec {
    /// Spec from a declared input shape, `-1` marking the batch axis.
    pub fn from_declared(
        input: &str,
        output: &str,
        dims: &[i64],
        ty: TensorElementType,
    ) -> std::result::Result<Self, ConfigError> {
        let unsupported = |reason| ConfigError::UnsupportedModelInput {
            name: input.to_string(),
            reason,
        };

        let ty = match ty {
            TensorElementType::Float32 => CacheType::F32,
            TensorElementType::Int64 => CacheType::I64,
            _ => return Err(unsupported("cache tensors must be f32 or i64")),
        };

        let mut dynamic = dims
            .iter()
            .enumerate()
            .filter_map(|(axis, &d)| (d <= 0).then_some(axis));
        let batch_axis = dynamic
            .next()
            .ok_or_else(|| unsupported("no dynamic batch axis"))?;
        if dynamic.next().is_some() {
            return Err(unsupported("more than one dynamic axis"));
        }

        let shape = dims
            .iter()
            .map(|&d| if d <= 0 { 1 } else { d as usize })
            .collect();

        Ok(Self {
            input: input.to_string(),
            output: output.to_string(),
            batch_axis,
            shape,
            ty,
        })
    }

    /// Zero cache for a new stream.
    pub fn zeros(&self) -> CacheTensor {
        match self.ty {
            CacheType::F32 => CacheTensor::F32(ArrayD::zeros(IxDyn(&self.shape))),
            CacheType::I64 => CacheTensor::I64(ArrayD::zeros(IxDyn(&self.shape))),
        }
    }

    /// Concatenate the per-stream tensors along the batch axis.
    pub fn stack<'a>(&self, parts: impl Iterator<Item = &'a CacheTensor>) -> Result<CacheTensor> {
        let axis = Axis(self.batch_axis);
        let mismatch = || self.type_mismatch();

        Ok(match self.ty {
            CacheType::F32 => {
                let views = parts
                    .map(|part| match part {
                        CacheTensor::F32(array) => Ok(array.view()),
                        CacheTensor::I64(_) => Err(mismatch()),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                CacheTensor::F32(concatenate(axis, &views)?)
            }
            CacheType::I64 => {
                let views = parts
                    .map(|part| match part {
                        CacheTensor::I64(array) => Ok(array.view()),
                        CacheTensor::F32(_) => Err(mismatch()),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                CacheTensor::I64(concatenate(axis, &views)?)
            }
        })
    }

    /// Split a batched tensor back into `batch` per-stream tensors.
    pub fn split(&self, batched: &CacheTensor, batch: usize) -> Result<Vec<CacheTensor>> {
        let axis = Axis(self.batch_axis);
        let got = match batched {
            CacheTensor::F32(array) => array.shape().to_vec(),
            CacheTensor::I64(array) => array.shape().to_vec(),
        };
        if got.get(self.batch_axis) != Some(&batch) {
            let mut expected = self.shape.clone();
            if let Some(dim) = expected.get_mut(self.batch_axis) {
                *dim = batch;
            }
            return Err(BackendError::ShapeMismatch {
                name: self.output.clone(),
                expected,
                got,
            }
            .into());
        }

        let row = |i: usize| Slice::from(i..i + 1);
        Ok((0..batch)
            .map(|i| match batched {
                CacheTensor::F32(array) => {
                    CacheTensor::F32(array.slice_axis(axis, row(i)).to_owned())
                }
                CacheTensor::I64(array) => {
                    CacheTensor::I64(array.slice_axis(axis, row(i)).to_owned())
                }
            })
            .collect())
    }

    fn extract(&self, value: &DynValue) -> Result<CacheTensor> {
        Ok(match self.ty {
            CacheType::F32 => CacheTensor::F32(extract_f32::<IxDyn>(value)?),
            CacheType::I64 => CacheTensor::I64(extract_i64::<IxDyn>(value)?),
        })
    }

    fn type_mismatch(&self) -> crate::error::Error {
        BackendError::ShapeMismatch {
            name: self.input.clone(),
            expected: self.shape.clone(),
            got: Vec::new(),
        }
        .into()
    }
}

/// Streaming transducer (icefall streaming zipformer exports).
///
/// The encoder takes a window `x` of `T` feature frames plus one input per
/// cache tensor, and returns `encoder_out` for the first `decode_chunk_len`
/// frames along with each cache under a `new_` (or `next_`) prefixed name.
/// Both window sizes come from encoder metadata.
pub struct OnnxStreamingTransducer {
    encoder: Session,
    prediction: Prediction,
    caches: Vec<CacheSpec>,
    feature_dim: usize,
    window: usize,
    shift: usize,
}

impl OnnxStreamingTransducer {
    pub fn from_repo(
        repo: &ModelRepo,
        config: &ModelConfig,
        features: &FeatureConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let (prediction, encoder_path) = Prediction::load(repo, config)?;
        let encoder = load_session(&session_builder(config)?, &encoder_path, config.debug)?;

        let window = metadata_value::<usize>(&encoder, "T")?;
        let shift = metadata_value::<usize>(&encoder, "decode_chunk_len")?;
        if shift == 0 || shift > window {
            return Err(ConfigError::InvalidMetadata {
                key: "decode_chunk_len".to_string(),
                value: shift.to_string(),
            });
        }

        let caches = Self::cache_specs(&encoder)?;

        tracing::info!(
            window,
            shift,
            caches = caches.len(),
            context_size = prediction.context_size,
            "streaming transducer model loaded"
        );

        Ok(Self {
            encoder,
            prediction,
            caches,
            feature_dim: features.feature_dim,
            window,
            shift,
        })
    }

    /// Every encoder input other than `x` is a cache.
    fn cache_specs(encoder: &Session) -> std::result::Result<Vec<CacheSpec>, ConfigError> {
        encoder
            .inputs
            .iter()
            .filter(|input| input.name != "x")
            .map(|input| {
                let output = CACHE_OUTPUT_PREFIXES
                    .iter()
                    .map(|prefix| format!("{prefix}{}", input.name))
                    .find(|name| encoder.outputs.iter().any(|output| &output.name == name))
                    .ok_or_else(|| ConfigError::UnsupportedModelInput {
                        name: input.name.clone(),
                        reason: "no matching cache output",
                    })?;

                let (dims, ty) = input
                    .input_type
                    .tensor_shape()
                    .zip(input.input_type.tensor_type())
                    .ok_or_else(|| ConfigError::UnsupportedModelInput {
                        name: input.name.clone(),
                        reason: "not a tensor",
                    })?;

                CacheSpec::from_declared(&input.name, &output, dims, ty)
            })
            .collect()
    }

    pub fn caches(&self) -> &[CacheSpec] {
        &self.caches
    }
}

impl TransducerModel for OnnxStreamingTransducer {
    type EncoderState = EncoderCache;

    fn mode(&self) -> DecodeMode {
        DecodeMode::Streaming {
            window: self.window,
            shift: self.shift,
        }
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn frame_shift_secs(&self) -> f32 {
        FRAME_SHIFT_SECS
    }

    fn blank_id(&self) -> usize {
        0
    }

    fn context_size(&self) -> usize {
        self.prediction.context_size
    }

    fn init_encoder_state(&self) -> Self::EncoderState {
        EncoderCache {
            tensors: self.caches.iter().map(CacheSpec::zeros).collect(),
        }
    }

    fn encode(
        &mut self,
        features: Array3<f32>,
        _lengths: Array1<i64>,
        states: &[&Self::EncoderState],
    ) -> Result<(Array3<f32>, Array1<i64>, Vec<Self::EncoderState>)> {
        let batch = states.len();

        // Cache inputs vary per export, so inputs are assembled by name
        let mut run_inputs: Vec<(String, DynValue)> = Vec::with_capacity(self.caches.len() + 1);
        run_inputs.push(("x".to_string(), Tensor::from_array(features)?.into_dyn()));
        for (k, spec) in self.caches.iter().enumerate() {
            let parts = states.iter().filter_map(|state| state.tensors.get(k));
            run_inputs.push((spec.input.clone(), spec.stack(parts)?.into_value()?));
        }

        let mut outputs = self.encoder.run(SessionInputs::from(run_inputs))?;

        let encoder_out = outputs
            .remove("encoder_out")
            .ok_or_else(|| missing_output("encoder_out"))?;
        let encoder_out = extract_f32::<Ix3>(&encoder_out)?;

        let mut next: Vec<EncoderCache> = vec![EncoderCache::default(); batch];
        for spec in &self.caches {
            let value = outputs
                .remove(&spec.output)
                .ok_or_else(|| missing_output(&spec.output))?;
            let per_stream = spec.split(&spec.extract(&value)?, batch)?;
            for (cache, tensor) in next.iter_mut().zip(per_stream) {
                cache.tensors.push(tensor);
            }
        }

        let out_lengths = Array1::from_elem(batch, encoder_out.dim().1 as i64);

        tracing::debug!(shape = ?encoder_out.shape(), "streaming encoder forward");

        Ok((encoder_out, out_lengths, next))
    }

    fn run_decoder(&mut self, contexts: Array2<i64>) -> Result<Array2<f32>> {
        self.prediction.run_decoder(contexts)
    }

    fn run_joiner(
        &mut self,
        encoder_out: Array2<f32>,
        decoder_out: Array2<f32>,
    ) -> Result<Array2<f32>> {
        self.prediction.run_joiner(encoder_out, decoder_out)
    }
}

//! ONNX Whisper encoder/decoder backend.

use crate::config::{FeatureConfig, ModelConfig};
use crate::error::{ConfigError, Result};
use crate::models::onnx::{
    extract_f32, load_session, metadata_list, metadata_opt, metadata_value, missing_output,
    session_builder,
};
use crate::models::{WhisperMetadata, WhisperModel};
use crate::types::ModelRepo;
use ndarray::prelude::*;
use ort::inputs;
use ort::session::Session;
use ort::value::{Tensor, TensorRef};
use std::f32::consts::LN_10;

/// Encoder input length: 30 seconds of 10ms frames.
const NUM_ENCODER_FRAMES: usize = 3000;

/// Whisper encoder and decoder sessions plus model constants.
///
/// The encoder takes `mel` `(N, n_mels, 3000)` and produces `n_layer_cross_k`
/// and `n_layer_cross_v`. The decoder takes `tokens`, the self caches
/// `in_n_layer_self_{k,v}_cache`, the cross caches and `offset`, and produces
/// `logits` and `out_n_layer_self_{k,v}_cache`.
pub struct OnnxWhisper {
    encoder: Session,
    decoder: Session,
    metadata: WhisperMetadata,
    feature_dim: usize,
}

impl OnnxWhisper {
    pub fn from_repo(
        repo: &ModelRepo,
        config: &ModelConfig,
        features: &FeatureConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let encoder_path =
            repo.resolve_required(config.whisper_encoder.as_ref(), "whisper encoder")?;
        let decoder_path =
            repo.resolve_required(config.whisper_decoder.as_ref(), "whisper decoder")?;

        let builder = session_builder(config)?;
        let encoder = load_session(&builder, &encoder_path, config.debug)?;
        let decoder = load_session(&builder, &decoder_path, config.debug)?;

        let metadata = WhisperMetadata {
            n_text_layer: metadata_value(&encoder, "n_text_layer")?,
            n_text_ctx: metadata_value(&encoder, "n_text_ctx")?,
            n_text_state: metadata_value(&encoder, "n_text_state")?,
            sot_sequence: metadata_list(&encoder, "sot_sequence")?,
            eot: metadata_value(&encoder, "eot")?,
            no_timestamps: metadata_opt(&encoder, "no_timestamps")?,
        };

        if metadata.sot_sequence.is_empty() {
            return Err(ConfigError::InvalidMetadata {
                key: "sot_sequence".to_string(),
                value: String::new(),
            });
        }

        let feature_dim = metadata_opt::<usize>(&encoder, "n_mels")?.unwrap_or(features.feature_dim);

        if config.debug {
            tracing::info!(?metadata, feature_dim, "whisper metadata");
        }
        tracing::info!(
            layers = metadata.n_text_layer,
            ctx = metadata.n_text_ctx,
            "whisper model loaded"
        );

        Ok(Self {
            encoder,
            decoder,
            metadata,
            feature_dim,
        })
    }
}

/// Whisper log-mel normalization over the true frames of one utterance.
///
/// Natural-log energies become log10, are clamped to 8 below the maximum and
/// scaled to roughly `[-1, 1]`.
fn normalize_features(mut features: ArrayViewMut2<f32>) {
    features.mapv_inplace(|x| x / LN_10);

    let max = features.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let floor = max - 8.0;

    features.mapv_inplace(|x| (x.max(floor) + 4.0) / 4.0);
}

impl WhisperModel for OnnxWhisper {
    fn metadata(&self) -> &WhisperMetadata {
        &self.metadata
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn frame_shift_secs(&self) -> f32 {
        0.01
    }

    fn encode(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let (batch, frames, dim) = features.dim();
        if frames > NUM_ENCODER_FRAMES {
            tracing::warn!(
                frames,
                max = NUM_ENCODER_FRAMES,
                "audio longer than 30s, extra frames ignored"
            );
        }

        // (N, n_mels, 3000) with zeros past each utterance
        let mut mel = Array3::<f32>::zeros((batch, dim, NUM_ENCODER_FRAMES));
        for (i, &length) in lengths.iter().enumerate() {
            let length = (length.max(0) as usize).min(frames).min(NUM_ENCODER_FRAMES);
            let mut utterance = features.slice(s![i, ..length, ..]).to_owned();
            normalize_features(utterance.view_mut());
            mel.slice_mut(s![i, .., ..length])
                .assign(&utterance.reversed_axes());
        }

        let mel = Tensor::from_array(mel)?;
        let mut outputs = self.encoder.run(inputs!("mel" => mel))?;

        let cross_k = outputs
            .remove("n_layer_cross_k")
            .ok_or_else(|| missing_output("n_layer_cross_k"))?;
        let cross_v = outputs
            .remove("n_layer_cross_v")
            .ok_or_else(|| missing_output("n_layer_cross_v"))?;

        Ok((extract_f32::<Ix4>(&cross_k)?, extract_f32::<Ix4>(&cross_v)?))
    }

    fn decode(
        &mut self,
        tokens: Array2<i64>,
        self_k: ArrayView4<f32>,
        self_v: ArrayView4<f32>,
        cross_k: ArrayView4<f32>,
        cross_v: ArrayView4<f32>,
        offset: usize,
    ) -> Result<(Array3<f32>, Array4<f32>, Array4<f32>)> {
        let tokens = Tensor::from_array(tokens)?;
        let offset = Tensor::from_array(Array1::from_elem((1,), offset as i64))?;

        let self_k = self_k.as_standard_layout().into_dyn();
        let self_v = self_v.as_standard_layout().into_dyn();
        let cross_k = cross_k.as_standard_layout().into_dyn();
        let cross_v = cross_v.as_standard_layout().into_dyn();

        let mut outputs = self.decoder.run(inputs!(
            "tokens" => tokens,
            "in_n_layer_self_k_cache" => TensorRef::from_array_view(self_k.view())?,
            "in_n_layer_self_v_cache" => TensorRef::from_array_view(self_v.view())?,
            "n_layer_cross_k" => TensorRef::from_array_view(cross_k.view())?,
            "n_layer_cross_v" => TensorRef::from_array_view(cross_v.view())?,
            "offset" => offset,
        ))?;

        let logits = outputs
            .remove("logits")
            .ok_or_else(|| missing_output("logits"))?;
        let out_k = outputs
            .remove("out_n_layer_self_k_cache")
            .ok_or_else(|| missing_output("out_n_layer_self_k_cache"))?;
        let out_v = outputs
            .remove("out_n_layer_self_v_cache")
            .ok_or_else(|| missing_output("out_n_layer_self_v_cache"))?;

        Ok((
            extract_f32::<Ix3>(&logits)?,
            extract_f32::<Ix4>(&out_k)?,
            extract_f32::<Ix4>(&out_v)?,
        ))
    }
}

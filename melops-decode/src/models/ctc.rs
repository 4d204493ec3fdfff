//! ONNX single-pass backends: NeMo CTC and Paraformer.

use crate::config::{FeatureConfig, ModelConfig};
use crate::error::{ConfigError, Result};
use crate::models::onnx::{
    extract_f32, extract_i64, load_session, metadata_list, metadata_opt, metadata_value,
    missing_output, session_builder,
};
use crate::models::{CtcModel, OutputAlignment};
use crate::types::{DecodeMode, ModelRepo};
use ndarray::prelude::*;
use ort::inputs;
use ort::session::Session;
use ort::value::{DynValue, Tensor};

/// Input frame shift in seconds.
const INPUT_FRAME_SHIFT_SECS: f32 = 0.01;

/// Read output lengths stored as either i64 or i32.
fn extract_lengths(value: &DynValue) -> Result<Array1<i64>> {
    match extract_i64::<Ix1>(value) {
        Ok(lengths) => Ok(lengths),
        Err(_) => {
            let lengths = value.try_extract_array::<i32>()?;
            Ok(lengths
                .to_owned()
                .into_dimensionality::<Ix1>()?
                .mapv(i64::from))
        }
    }
}

/// NeMo CTC model: `audio_signal` `(N, dim, T)` and `length` to `logprobs`.
///
/// The blank is the last vocabulary entry.
pub struct OnnxNemoCtc {
    session: Session,
    feature_dim: usize,
    vocab_size: usize,
    subsampling_factor: usize,
    per_feature_normalize: bool,
}

impl OnnxNemoCtc {
    pub fn from_repo(
        repo: &ModelRepo,
        config: &ModelConfig,
        features: &FeatureConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let path = repo.resolve_required(config.nemo_ctc.as_ref(), "nemo ctc model")?;
        let builder = session_builder(config)?;
        let session = load_session(&builder, &path, config.debug)?;

        let vocab_size = metadata_value::<usize>(&session, "vocab_size")?;
        let subsampling_factor =
            metadata_opt::<usize>(&session, "subsampling_factor")?
                .unwrap_or(8)
                .max(1);
        let normalize_type = metadata_opt::<String>(&session, "normalize_type")?;
        let per_feature_normalize = normalize_type.as_deref() == Some("per_feature");

        tracing::info!(
            vocab_size,
            subsampling_factor,
            ?normalize_type,
            "nemo ctc model loaded"
        );

        Ok(Self {
            session,
            feature_dim: features.feature_dim,
            vocab_size,
            subsampling_factor,
            per_feature_normalize,
        })
    }
}

/// Zero-mean unit-variance normalization of each feature dimension.
fn normalize_per_feature(mut features: ArrayViewMut2<f32>) {
    if features.nrows() < 2 {
        return;
    }

    for mut column in features.columns_mut() {
        let mean = column.mean().unwrap_or(0.0);
        let var = column.mapv(|x| (x - mean).powi(2)).sum() / (column.len() - 1) as f32;
        let std = var.sqrt() + 1e-5;
        column.mapv_inplace(|x| (x - mean) / std);
    }
}

impl CtcModel for OnnxNemoCtc {
    fn mode(&self) -> DecodeMode {
        DecodeMode::Offline
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn frame_shift_secs(&self) -> f32 {
        INPUT_FRAME_SHIFT_SECS * self.subsampling_factor as f32
    }

    fn blank_id(&self) -> usize {
        self.vocab_size.saturating_sub(1)
    }

    fn alignment(&self) -> OutputAlignment {
        OutputAlignment::Frame
    }

    fn forward(
        &mut self,
        mut features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array3<f32>, Array1<i64>)> {
        if self.per_feature_normalize {
            for (i, &length) in lengths.iter().enumerate() {
                let length = (length.max(0) as usize).min(features.dim().1);
                normalize_per_feature(features.slice_mut(s![i, ..length, ..]));
            }
        }

        // (N, T, dim) -> (N, dim, T)
        let audio_signal = features.permuted_axes([0, 2, 1]).as_standard_layout().to_owned();
        let audio_signal = Tensor::from_array(audio_signal)?;
        let length = Tensor::from_array(lengths.clone())?;

        let mut outputs = self.session.run(inputs!(
            "audio_signal" => audio_signal,
            "length" => length,
        ))?;

        let logprobs = outputs
            .remove("logprobs")
            .ok_or_else(|| missing_output("logprobs"))?;
        let logprobs = extract_f32::<Ix3>(&logprobs)?;

        let factor = self.subsampling_factor as i64;
        let out_frames = logprobs.dim().1 as i64;
        let out_lengths = lengths.mapv(|len| ((len + factor - 1) / factor).min(out_frames));

        Ok((logprobs, out_lengths))
    }
}

/// Low frame rate stacking: `window` consecutive frames every `shift`.
pub fn apply_lfr(features: ArrayView2<f32>, window: usize, shift: usize) -> Array2<f32> {
    let (num_frames, dim) = features.dim();

    if num_frames < window || window == 0 || shift == 0 {
        return Array2::zeros((0, dim * window));
    }

    let num_output = (num_frames - window) / shift + 1;
    let mut output = Array2::<f32>::zeros((num_output, dim * window));

    for (i, mut row) in output.rows_mut().into_iter().enumerate() {
        let start = i * shift;
        let stacked = features.slice(s![start..start + window, ..]);
        row.assign(&Array1::from_iter(stacked.iter().copied()));
    }

    output
}

/// Global CMVN as stored in Paraformer metadata: `(x + neg_mean) * inv_stddev`.
#[derive(Clone, Debug)]
struct Cmvn {
    neg_mean: Array1<f32>,
    inv_stddev: Option<Array1<f32>>,
}

impl Cmvn {
    fn apply(&self, features: &mut Array2<f32>) {
        if features.ncols() != self.neg_mean.len() {
            return;
        }

        *features += &self.neg_mean;
        if let Some(inv_stddev) = &self.inv_stddev
            && inv_stddev.len() == features.ncols()
        {
            *features *= inv_stddev;
        }
    }
}

/// Paraformer model: `speech`, `speech_lengths` to `logits`, `token_num`.
///
/// Output positions are tokens, not frames; the trailing end-of-sentence
/// position is dropped from each length.
pub struct OnnxParaformer {
    session: Session,
    feature_dim: usize,
    lfr_window_size: usize,
    lfr_window_shift: usize,
    cmvn: Option<Cmvn>,
}

impl OnnxParaformer {
    pub fn from_repo(
        repo: &ModelRepo,
        config: &ModelConfig,
        features: &FeatureConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let path = repo.resolve_required(config.paraformer.as_ref(), "paraformer model")?;
        let builder = session_builder(config)?;
        let session = load_session(&builder, &path, config.debug)?;

        let lfr_window_size = metadata_opt::<usize>(&session, "lfr_window_size")?
            .unwrap_or(7)
            .max(1);
        let lfr_window_shift = metadata_opt::<usize>(&session, "lfr_window_shift")?
            .unwrap_or(6)
            .max(1);

        let cmvn = match metadata_list::<f32>(&session, "neg_mean") {
            Ok(neg_mean) => Some(Cmvn {
                neg_mean: Array1::from_vec(neg_mean),
                inv_stddev: metadata_list::<f32>(&session, "inv_stddev")
                    .ok()
                    .map(Array1::from_vec),
            }),
            Err(ConfigError::MissingMetadata { .. }) => {
                tracing::warn!("paraformer metadata has no CMVN, features left unnormalized");
                None
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            lfr_window_size,
            lfr_window_shift,
            cmvn = cmvn.is_some(),
            "paraformer model loaded"
        );

        Ok(Self {
            session,
            feature_dim: features.feature_dim,
            lfr_window_size,
            lfr_window_shift,
            cmvn,
        })
    }
}

impl CtcModel for OnnxParaformer {
    fn mode(&self) -> DecodeMode {
        DecodeMode::Offline
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn frame_shift_secs(&self) -> f32 {
        INPUT_FRAME_SHIFT_SECS * self.lfr_window_shift as f32
    }

    fn blank_id(&self) -> usize {
        0
    }

    fn alignment(&self) -> OutputAlignment {
        OutputAlignment::Token
    }

    fn forward(
        &mut self,
        features: Array3<f32>,
        lengths: Array1<i64>,
    ) -> Result<(Array3<f32>, Array1<i64>)> {
        let batch = features.dim().0;
        let stacked_dim = self.feature_dim * self.lfr_window_size;

        let stacked: Vec<Array2<f32>> = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| {
                let length = (length.max(0) as usize).min(features.dim().1);
                let mut lfr = apply_lfr(
                    features.slice(s![i, ..length, ..]),
                    self.lfr_window_size,
                    self.lfr_window_shift,
                );
                if let Some(cmvn) = &self.cmvn {
                    cmvn.apply(&mut lfr);
                }
                lfr
            })
            .collect();

        let max_len = stacked.iter().map(Array2::nrows).max().unwrap_or(0).max(1);
        let mut speech = Array3::<f32>::zeros((batch, max_len, stacked_dim));
        for (i, lfr) in stacked.iter().enumerate() {
            speech.slice_mut(s![i, ..lfr.nrows(), ..]).assign(lfr);
        }
        let speech_lengths: Array1<i32> = stacked.iter().map(|lfr| lfr.nrows() as i32).collect();

        let speech = Tensor::from_array(speech)?;
        let speech_lengths = Tensor::from_array(speech_lengths)?;

        let mut outputs = self.session.run(inputs!(
            "speech" => speech,
            "speech_lengths" => speech_lengths,
        ))?;

        let logits = outputs
            .remove("logits")
            .ok_or_else(|| missing_output("logits"))?;
        let token_num = outputs
            .remove("token_num")
            .ok_or_else(|| missing_output("token_num"))?;

        let logits = extract_f32::<Ix3>(&logits)?;
        let token_num = extract_lengths(&token_num)?;

        let positions = logits.dim().1 as i64;
        let lengths = token_num.mapv(|n| (n - 1).clamp(0, positions));

        Ok((logits, lengths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lfr_stacks_windows() {
        let features = Array2::from_shape_fn((8, 2), |(t, d)| (t * 10 + d) as f32);

        let stacked = apply_lfr(features.view(), 3, 2);

        assert_eq!(stacked.dim(), (3, 6));
        assert_eq!(stacked.row(1).to_vec(), vec![20.0, 21.0, 30.0, 31.0, 40.0, 41.0]);
    }

    #[test]
    fn lfr_needs_one_full_window() {
        let features = Array2::<f32>::zeros((2, 4));

        assert_eq!(apply_lfr(features.view(), 7, 6).dim(), (0, 28));
    }

    #[test]
    fn cmvn_shifts_and_scales() {
        let cmvn = Cmvn {
            neg_mean: Array1::from_vec(vec![-1.0, 1.0]),
            inv_stddev: Some(Array1::from_vec(vec![2.0, 0.5])),
        };
        let mut features = Array2::from_shape_vec((1, 2), vec![3.0, 3.0]).unwrap();

        cmvn.apply(&mut features);

        assert_eq!(features.row(0).to_vec(), vec![4.0, 2.0]);
    }

    #[test]
    fn per_feature_normalization_centers_columns() {
        let mut features = Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap();

        normalize_per_feature(features.view_mut());

        assert!(features.column(0).sum().abs() < 1e-5);
        assert!((features[[2, 0]] - 1.0).abs() < 1e-3);
    }
}

//! Streaming log-mel filterbank feature extraction.

use ndarray::Array2;
use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Mel filterbank parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct MelConfig {
    pub n_mels: usize,
    pub hop_length: usize,
    pub n_fft: usize,
    pub preemphasis: f32,
    pub sample_rate: usize,
    pub win_length: usize,
}

impl MelConfig {
    /// 25ms windows every 10ms, as expected by transducer and CTC models.
    pub fn new(sample_rate: u32, n_mels: usize) -> Self {
        let sample_rate = sample_rate as usize;
        let win_length = (sample_rate / 40).max(1);
        Self {
            n_mels,
            hop_length: (sample_rate / 100).max(1),
            n_fft: win_length.next_power_of_two(),
            preemphasis: 0.97,
            sample_rate,
            win_length,
        }
    }

    /// Frame shift in seconds.
    pub fn frame_shift_secs(&self) -> f32 {
        self.hop_length as f32 / self.sample_rate as f32
    }
}

/// Incremental log-mel filterbank.
///
/// Samples are buffered between calls; a frame is emitted as soon as a full
/// window is available, so feeding audio in arbitrary pieces produces the same
/// frames as feeding it at once. Trailing samples shorter than a window are
/// dropped when the stream finishes.
pub struct MelFbank {
    config: MelConfig,
    window: Vec<f32>,
    filterbank: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
    pending: Vec<f32>,
}

impl fmt::Debug for MelFbank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MelFbank")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MelFbank {
    pub fn new(config: MelConfig) -> Self {
        let window = hann_window(config.win_length);
        let filterbank = create_mel_filterbank(config.n_fft, config.n_mels, config.sample_rate);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Feed samples and return every newly completed frame `(frames, n_mels)`.
    pub fn accept(&mut self, samples: &[f32]) -> Array2<f32> {
        self.pending.extend_from_slice(samples);

        let MelConfig {
            win_length,
            hop_length,
            ..
        } = self.config;

        if self.pending.len() < win_length {
            return Array2::zeros((0, self.config.n_mels));
        }

        let num_frames = (self.pending.len() - win_length) / hop_length + 1;
        let mut features = Array2::<f32>::zeros((num_frames, self.config.n_mels));

        for (frame_idx, mut row) in features.rows_mut().into_iter().enumerate() {
            let start = frame_idx * hop_length;
            let power = self.power_spectrum(&self.pending[start..start + win_length]);
            let mel = self.filterbank.dot(&power);
            row.assign(&mel.mapv(|x| x.max(1e-10).ln()));
        }

        self.pending.drain(..num_frames * hop_length);
        features
    }

    /// Power spectrum of one window, with per-frame preemphasis.
    fn power_spectrum(&self, frame: &[f32]) -> ndarray::Array1<f32> {
        let coef = self.config.preemphasis;
        let mut buffer = vec![Complex::new(0.0, 0.0); self.config.n_fft];

        for (i, slot) in buffer.iter_mut().take(frame.len()).enumerate() {
            let prev = if i == 0 { frame[0] } else { frame[i - 1] };
            let value = frame[i] - coef * prev;
            *slot = Complex::new(value * self.window[i], 0.0);
        }

        self.fft.process(&mut buffer);

        let freq_bins = self.config.n_fft / 2 + 1;
        buffer[..freq_bins].iter().map(|c| c.norm_sqr()).collect()
    }
}

/// Create Hann window.
fn hann_window(window_length: usize) -> Vec<f32> {
    (0..window_length)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (window_length as f32 - 1.0)).cos())
        .collect()
}

/// Convert frequency in Hz to mel scale.
fn hz_to_mel(freq: f32) -> f32 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

/// Convert mel scale to frequency in Hz.
fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Create mel filterbank `(n_mels, n_fft / 2 + 1)`.
fn create_mel_filterbank(n_fft: usize, n_mels: usize, sample_rate: usize) -> Array2<f32> {
    let freq_bins = n_fft / 2 + 1;
    let mut filterbank = Array2::<f32>::zeros((n_mels, freq_bins));

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);

    let mel_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let freq_bin_width = sample_rate as f32 / n_fft as f32;

    for mel_idx in 0..n_mels {
        let left = mel_points[mel_idx];
        let center = mel_points[mel_idx + 1];
        let right = mel_points[mel_idx + 2];

        for freq_idx in 0..freq_bins {
            let freq = freq_idx as f32 * freq_bin_width;

            if freq >= left && freq <= center {
                filterbank[[mel_idx, freq_idx]] = (freq - left) / (center - left);
            } else if freq > center && freq <= right {
                filterbank[[mel_idx, freq_idx]] = (right - freq) / (right - center);
            }
        }
    }

    filterbank
}

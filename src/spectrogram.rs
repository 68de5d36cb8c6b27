//! Spectrogram computation: window -> STFT -> power -> (mel filterbank) -> (log).
//!
//! Frames are not centered: a signal of `n` samples yields
//! `(n - n_fft) / hop + 1` frames, and anything shorter than one window is an error.

use realfft::{RealFftPlanner, RealToComplex};
use serde::Deserialize;
use std::f32::consts::PI;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrogramError {
    #[error("empty signal")]
    EmptySignal,
    #[error("signal of {len} samples is shorter than one window ({n_fft})")]
    SignalTooShort { len: usize, n_fft: usize },
    #[error("invalid spectrogram config: {0}")]
    InvalidConfig(String),
    #[error("FFT failed: {0}")]
    Fft(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hann,
    Hamming,
}

impl WindowKind {
    /// Periodic window of length `n`.
    fn coefficients(self, n: usize) -> Vec<f32> {
        let (a0, a1) = match self {
            WindowKind::Hann => (0.5, 0.5),
            WindowKind::Hamming => (0.54, 0.46),
        };
        (0..n)
            .map(|i| a0 - a1 * (2.0 * PI * i as f32 / n as f32).cos())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FrequencyScale {
    /// Triangular mel filterbank. `f_max = None` means Nyquist.
    Mel {
        n_mels: usize,
        #[serde(default)]
        f_min: f32,
        #[serde(default)]
        f_max: Option<f32>,
    },
    /// Raw FFT bins, `n_fft / 2 + 1` rows.
    Linear,
}

/// Spectrogram configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpectrogramConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub window: WindowKind,
    pub scale: FrequencyScale,
    /// Natural log of the power, floored at 1e-10.
    pub log: bool,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self::bird_calls(128)
    }
}

impl SpectrogramConfig {
    /// Window 2048, hop 512, Hann, power mel.
    pub fn bird_calls(n_mels: usize) -> Self {
        Self {
            n_fft: 2048,
            hop_length: 512,
            window: WindowKind::Hann,
            scale: FrequencyScale::Mel {
                n_mels,
                f_min: 0.0,
                f_max: None,
            },
            log: false,
        }
    }

    /// Hop of a quarter window, Hamming, power mel.
    pub fn quarter_hop(n_fft: usize, n_mels: usize) -> Self {
        Self {
            n_fft,
            hop_length: ((n_fft as f32) * 0.25).round() as usize,
            window: WindowKind::Hamming,
            scale: FrequencyScale::Mel {
                n_mels,
                f_min: 0.0,
                f_max: None,
            },
            log: false,
        }
    }

    pub fn n_bins(&self) -> usize {
        match self.scale {
            FrequencyScale::Mel { n_mels, .. } => n_mels,
            FrequencyScale::Linear => self.n_fft / 2 + 1,
        }
    }

    /// Number of output frames for `n_samples` input samples.
    pub fn n_frames(&self, n_samples: usize) -> usize {
        if self.hop_length == 0 || n_samples < self.n_fft {
            return 0;
        }
        (n_samples - self.n_fft) / self.hop_length + 1
    }

    pub fn validate(&self) -> Result<(), SpectrogramError> {
        if self.n_fft < 2 {
            return Err(SpectrogramError::InvalidConfig(format!(
                "n_fft must be >= 2, got {}",
                self.n_fft
            )));
        }
        if self.hop_length == 0 {
            return Err(SpectrogramError::InvalidConfig("hop_length must be > 0".into()));
        }
        if let FrequencyScale::Mel { n_mels, f_min, f_max } = self.scale {
            if n_mels == 0 {
                return Err(SpectrogramError::InvalidConfig("n_mels must be > 0".into()));
            }
            if f_min < 0.0 || f_max.is_some_and(|f| f <= f_min) {
                return Err(SpectrogramError::InvalidConfig(format!(
                    "invalid mel range [{f_min}, {f_max:?}]"
                )));
            }
        }
        Ok(())
    }
}

/// Row-major `[n_bins, n_frames]` matrix: rows are frequency bins, columns time frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub data: Vec<f32>,
    pub n_bins: usize,
    pub n_frames: usize,
}

impl Spectrogram {
    pub fn new(data: Vec<f32>, n_bins: usize, n_frames: usize) -> Self {
        debug_assert_eq!(data.len(), n_bins * n_frames);
        Self {
            data,
            n_bins,
            n_frames,
        }
    }

    pub fn zeros(n_bins: usize, n_frames: usize) -> Self {
        Self::new(vec![0.0; n_bins * n_frames], n_bins, n_frames)
    }

    pub fn get(&self, bin: usize, frame: usize) -> f32 {
        self.data[bin * self.n_frames + frame]
    }

    pub fn row(&self, bin: usize) -> &[f32] {
        &self.data[bin * self.n_frames..(bin + 1) * self.n_frames]
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_bins, self.n_frames)
    }
}

/// Precomputed spectrogram transform for one sample rate.
pub struct SpectrogramTransform {
    config: SpectrogramConfig,
    sample_rate: u32,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    mel_filterbank: Option<Vec<Vec<f32>>>, // [n_mels, n_fft/2 + 1]
}

impl SpectrogramTransform {
    pub fn new(config: SpectrogramConfig, sample_rate: u32) -> Result<Self, SpectrogramError> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(SpectrogramError::InvalidConfig("sample_rate must be > 0".into()));
        }

        let mut planner = RealFftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        let window = config.window.coefficients(config.n_fft);

        let mel_filterbank = match config.scale {
            FrequencyScale::Mel { n_mels, f_min, f_max } => Some(create_mel_filterbank(
                sample_rate,
                config.n_fft,
                n_mels,
                f_min,
                f_max.unwrap_or(sample_rate as f32 / 2.0),
            )),
            FrequencyScale::Linear => None,
        };

        Ok(Self {
            config,
            sample_rate,
            fft,
            window,
            mel_filterbank,
        })
    }

    pub fn config(&self) -> &SpectrogramConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Compute the spectrogram of mono `samples`.
    pub fn transform(&self, samples: &[f32]) -> Result<Spectrogram, SpectrogramError> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;

        if samples.is_empty() {
            return Err(SpectrogramError::EmptySignal);
        }
        let n_frames = self.config.n_frames(samples.len());
        if n_frames == 0 {
            return Err(SpectrogramError::SignalTooShort {
                len: samples.len(),
                n_fft,
            });
        }

        let n_bins = self.config.n_bins();
        let mut spectrogram = vec![0.0f32; n_bins * n_frames];

        // Scratch buffers
        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut power = vec![0.0f32; n_fft / 2 + 1];

        for frame in 0..n_frames {
            let start = frame * hop;
            for (dst, (&s, &w)) in input
                .iter_mut()
                .zip(samples[start..start + n_fft].iter().zip(&self.window))
            {
                *dst = s * w;
            }

            self.fft
                .process(&mut input, &mut spectrum)
                .map_err(|e| SpectrogramError::Fft(e.to_string()))?;

            for (p, c) in power.iter_mut().zip(&spectrum) {
                *p = c.norm_sqr();
            }

            match &self.mel_filterbank {
                Some(filterbank) => {
                    for (mel_idx, mel_filter) in filterbank.iter().enumerate() {
                        let energy: f32 = mel_filter.iter().zip(&power).map(|(w, p)| w * p).sum();
                        spectrogram[mel_idx * n_frames + frame] = energy;
                    }
                }
                None => {
                    for (bin, &p) in power.iter().enumerate() {
                        spectrogram[bin * n_frames + frame] = p;
                    }
                }
            }
        }

        if self.config.log {
            for v in &mut spectrogram {
                // Floor avoids -inf
                *v = v.max(1e-10).ln();
            }
        }

        Ok(Spectrogram::new(spectrogram, n_bins, n_frames))
    }

    /// Output shape `(n_bins, n_frames)` for a given input length.
    pub fn output_shape(&self, n_samples: usize) -> (usize, usize) {
        (self.config.n_bins(), self.config.n_frames(n_samples))
    }
}

/// One-shot `compute(samples, sample_rate, params)`.
pub fn compute(
    samples: &[f32],
    sample_rate: u32,
    config: &SpectrogramConfig,
) -> Result<Spectrogram, SpectrogramError> {
    SpectrogramTransform::new(config.clone(), sample_rate)?.transform(samples)
}

/// Create mel filterbank matrix.
fn create_mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    f_min: f32,
    f_max: f32,
) -> Vec<Vec<f32>> {
    let n_bins = n_fft / 2 + 1;

    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0);

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    // n_mels + 2 points for the edges, mapped back to FFT bins
    let bin_points: Vec<usize> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .map(|hz| ((n_fft as f32 * hz / sample_rate as f32).round() as usize).min(n_bins - 1))
        .collect();

    let mut filterbank = vec![vec![0.0f32; n_bins]; n_mels];

    for m in 0..n_mels {
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        // Rising edge
        if center > left {
            for k in left..center {
                filterbank[m][k] = (k - left) as f32 / (center - left) as f32;
            }
        }

        // Falling edge
        if right > center {
            for k in center..=right {
                filterbank[m][k] = (right - k) as f32 / (right - center) as f32;
            }
        }
    }

    filterbank
}

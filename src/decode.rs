//! Audio decoding using symphonia.
//!
//! Supports MP3, FLAC, OGG, WAV formats. Decoded audio is downmixed to mono
//! and optionally resampled before it reaches the cache.

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("Resampler error: {0}")]
    Resample(String),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Unsupported codec")]
    UnsupportedCodec,
    #[error("Decoded signal is empty")]
    Empty,
    #[error("Decode cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a caller and in-flight decodes.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), DecodeError> {
        if self.is_cancelled() {
            Err(DecodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Decoded audio samples (interleaved when `channels > 1`).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames() as f32 / self.sample_rate as f32
    }

    /// Convert to mono by averaging channels.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples.clone();
        }

        self.samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect()
    }

    /// Resample to target sample rate using sinc interpolation (rubato).
    /// Always returns mono audio.
    pub fn resample(&self, target_rate: u32) -> Result<DecodedAudio, DecodeError> {
        let mono = self.to_mono();
        if self.sample_rate == target_rate || mono.is_empty() {
            return Ok(DecodedAudio::mono(mono, self.sample_rate));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resample_ratio = target_rate as f64 / self.sample_rate as f64;
        let chunk_size = 1024;

        // max_resample_ratio_relative must cover the actual ratio (e.g. 8kHz -> 32kHz = 4x)
        let max_ratio = resample_ratio.max(1.0 / resample_ratio) * 1.1;

        let mut resampler = SincFixedIn::<f32>::new(resample_ratio, max_ratio, params, chunk_size, 1)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;

        let expected_len = (mono.len() as f64 * resample_ratio).round() as usize;
        let delay = resampler.output_delay();

        let mut output = Vec::with_capacity(delay + expected_len + 2 * chunk_size);
        for chunk in mono.chunks(chunk_size) {
            let resampled = if chunk.len() == chunk_size {
                resampler.process(&[chunk], None)
            } else {
                resampler.process_partial(Some(&[chunk][..]), None)
            }
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
            output.extend_from_slice(&resampled[0]);
        }

        // Flush the sinc tail until the delayed signal is complete
        while output.len() < delay + expected_len {
            let resampled = resampler
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(|e| DecodeError::Resample(e.to_string()))?;
            if resampled[0].is_empty() {
                break;
            }
            output.extend_from_slice(&resampled[0]);
        }

        output.drain(..delay.min(output.len()));
        output.truncate(expected_len);

        Ok(DecodedAudio::mono(output, target_rate))
    }
}

/// External decode primitive: `decode(path) -> (samples, sample_rate)`.
pub trait Decoder: Send + Sync {
    /// Decode the file at `path` into mono samples.
    ///
    /// Implementations must return an error rather than an empty buffer and
    /// should poll `cancel` between units of work.
    fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedAudio, DecodeError>;
}

/// File decoder backed by symphonia, with optional resampling.
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    /// Resample everything to this rate; `None` keeps the native rate.
    pub target_rate: Option<u32>,
}

impl SymphoniaDecoder {
    pub fn new(target_rate: Option<u32>) -> Self {
        Self { target_rate }
    }
}

impl Default for SymphoniaDecoder {
    fn default() -> Self {
        Self::new(Some(22050))
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedAudio, DecodeError> {
        let audio = decode_file(path, cancel)?;
        cancel.check()?;
        match self.target_rate {
            Some(rate) => audio.resample(rate),
            None => Ok(DecodedAudio::mono(audio.to_mono(), audio.sample_rate)),
        }
    }
}

/// Decode the audio file at `path`.
pub fn decode_file(path: &Path, cancel: &CancelToken) -> Result<DecodedAudio, DecodeError> {
    cancel.check()?;
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    // Find the first audio track
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(DecodeError::UnsupportedCodec)?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let track_id = track.id;
    let mut samples = Vec::new();

    loop {
        cancel.check()?;

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        append_samples(&decoded, &mut samples, channels)?;
    }

    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn append_samples(
    buffer: &AudioBufferRef,
    output: &mut Vec<f32>,
    channels: usize,
) -> Result<(), DecodeError> {
    match buffer {
        AudioBufferRef::F32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame]);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 32768.0);
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 2147483648.0);
                }
            }
        }
        AudioBufferRef::U8(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push((buf.chan(ch)[frame] as f32 - 128.0) / 128.0);
                }
            }
        }
        _ => {
            return Err(DecodeError::UnsupportedCodec);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample() {
        let audio = DecodedAudio::mono((0..44100).map(|i| (i as f32 / 44100.0).sin()).collect(), 44100);

        let resampled = audio.resample(22050).unwrap();
        assert_eq!(resampled.samples.len(), 22050);
        assert_eq!(resampled.sample_rate, 22050);
    }

    #[test]
    fn test_upsample_is_full_length_and_aligned() {
        // 0.5 s at 8 kHz, not a multiple of the chunk size
        let rate = 8000;
        let tone: Vec<f32> = (0..4000)
            .map(|i| (2.0 * std::f32::consts::PI * 300.0 * i as f32 / rate as f32).sin())
            .collect();
        let audio = DecodedAudio::mono(tone, rate);

        let up = audio.resample(16000).unwrap();
        assert_eq!(up.samples.len(), 8000);
        assert_eq!(up.sample_rate, 16000);

        // Delay removed: the resampled tone tracks the analytic one mid-clip
        for i in 2000..6000 {
            let expected = (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin();
            assert!((up.samples[i] - expected).abs() < 0.1, "sample {i}: {} vs {expected}", up.samples[i]);
        }
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let audio = DecodedAudio {
            samples: vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0],
            sample_rate: 8000,
            channels: 2,
        };
        assert_eq!(audio.to_mono(), vec![0.5, 0.5, 0.0]);
        assert_eq!(audio.frames(), 3);
    }

    #[test]
    fn test_missing_file() {
        let err = decode_file(Path::new("/nonexistent/clip.wav"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[test]
    fn test_cancelled_before_open() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = decode_file(Path::new("/nonexistent/clip.wav"), &cancel).unwrap_err();
        assert!(matches!(err, DecodeError::Cancelled));
    }
}

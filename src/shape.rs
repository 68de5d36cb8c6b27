//! Shape normalization: crop or zero-pad a spectrogram to a fixed
//! `(freq_bins, time_steps)` window, then broadcast it to a fixed channel count.

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::spectrogram::Spectrogram;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("invalid target shape {0:?}: every dimension must be > 0")]
    InvalidTarget([usize; 3]),
    #[error("input has {actual} frequency bins, target allows {target}")]
    TooManyBins { actual: usize, target: usize },
    #[error("tensor shape changed from {expected:?} to {actual:?}")]
    ShapeChanged {
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("data length {len} does not match shape {shape:?}")]
    DataLength { len: usize, shape: [usize; 3] },
}

/// Target `(channels, freq_bins, time_steps)` of every emitted tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TargetShape {
    pub channels: usize,
    pub freq_bins: usize,
    pub time_steps: usize,
}

impl Default for TargetShape {
    fn default() -> Self {
        Self {
            channels: 3,
            freq_bins: 128,
            time_steps: 128,
        }
    }
}

impl TargetShape {
    pub fn new(channels: usize, freq_bins: usize, time_steps: usize) -> Self {
        Self {
            channels,
            freq_bins,
            time_steps,
        }
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.channels == 0 || self.freq_bins == 0 || self.time_steps == 0 {
            return Err(ShapeError::InvalidTarget([
                self.channels,
                self.freq_bins,
                self.time_steps,
            ]));
        }
        Ok(())
    }

    pub fn numel(&self) -> usize {
        self.channels * self.freq_bins * self.time_steps
    }

    /// Tensor dimensions for `layout`.
    pub fn dims(&self, layout: Layout) -> [usize; 3] {
        match layout {
            Layout::ChannelFreqTime => [self.channels, self.freq_bins, self.time_steps],
            Layout::ChannelTimeFreq => [self.channels, self.time_steps, self.freq_bins],
        }
    }
}

/// How the time axis is fitted to `target.time_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropPolicy {
    /// Uniformly random window when too long, zero-pad when too short.
    #[default]
    RandomSubsample,
    /// Window at offset 0 when too long, zero-pad when too short.
    PadOnly,
    /// Centered window when too long, zero-pad when too short. Deterministic.
    Center,
}

/// Axis order of the emitted tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    ChannelFreqTime,
    ChannelTimeFreq,
}

/// Rank-3 float tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

impl FeatureTensor {
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self, ShapeError> {
        if data.len() != shape.iter().product::<usize>() {
            return Err(ShapeError::DataLength {
                len: data.len(),
                shape,
            });
        }
        Ok(Self { data, shape })
    }

    pub fn get(&self, c: usize, i: usize, j: usize) -> f32 {
        self.data[(c * self.shape[1] + i) * self.shape[2] + j]
    }

    /// One channel as a row-major `[shape[1], shape[2]]` slice.
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.shape[1] * self.shape[2];
        &self.data[c * plane..(c + 1) * plane]
    }
}

/// A spectrogram fitted to the target window, plus where the window started.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub matrix: Spectrogram,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeNormalizer {
    target: TargetShape,
    policy: CropPolicy,
    layout: Layout,
}

impl ShapeNormalizer {
    pub fn new(target: TargetShape, policy: CropPolicy, layout: Layout) -> Result<Self, ShapeError> {
        target.validate()?;
        Ok(Self {
            target,
            policy,
            layout,
        })
    }

    pub fn target(&self) -> TargetShape {
        self.target
    }

    pub fn dims(&self) -> [usize; 3] {
        self.target.dims(self.layout)
    }

    /// Fit `spec` to `(target.freq_bins, target.time_steps)`.
    ///
    /// Crops along time according to the policy; pads time and frequency with
    /// trailing zeros when undersized. The offset is 0 whenever no crop happened.
    pub fn normalize<R: Rng>(
        &self,
        spec: &Spectrogram,
        rng: &mut R,
    ) -> Result<Normalized, ShapeError> {
        let target_bins = self.target.freq_bins;
        let target_steps = self.target.time_steps;

        if spec.n_bins > target_bins {
            return Err(ShapeError::TooManyBins {
                actual: spec.n_bins,
                target: target_bins,
            });
        }

        let offset = if spec.n_frames > target_steps {
            let max_start = spec.n_frames - target_steps;
            match self.policy {
                CropPolicy::RandomSubsample => rng.gen_range(0..=max_start),
                CropPolicy::PadOnly => 0,
                CropPolicy::Center => max_start / 2,
            }
        } else {
            0
        };

        let copy_steps = spec.n_frames.min(target_steps);
        let mut out = Spectrogram::zeros(target_bins, target_steps);
        for bin in 0..spec.n_bins {
            let src = &spec.row(bin)[offset..offset + copy_steps];
            out.data[bin * target_steps..bin * target_steps + copy_steps].copy_from_slice(src);
        }

        Ok(Normalized {
            matrix: out,
            offset,
        })
    }

    /// Lay a fitted matrix out in the configured axis order and broadcast it
    /// to `target.channels`.
    pub fn to_tensor(&self, matrix: &Spectrogram) -> Result<FeatureTensor, ShapeError> {
        if matrix.shape() != (self.target.freq_bins, self.target.time_steps) {
            return Err(ShapeError::ShapeChanged {
                expected: self.dims(),
                actual: [1, matrix.n_bins, matrix.n_frames],
            });
        }

        let plane = match self.layout {
            Layout::ChannelFreqTime => matrix.data.clone(),
            Layout::ChannelTimeFreq => transpose(matrix),
        };
        replicate(&plane, self.dims())
    }
}

fn transpose(matrix: &Spectrogram) -> Vec<f32> {
    let mut out = vec![0.0; matrix.data.len()];
    for bin in 0..matrix.n_bins {
        for frame in 0..matrix.n_frames {
            out[frame * matrix.n_bins + bin] = matrix.get(bin, frame);
        }
    }
    out
}

/// Broadcast one `[dims[1], dims[2]]` plane across `dims[0]` channels.
pub fn replicate(plane: &[f32], dims: [usize; 3]) -> Result<FeatureTensor, ShapeError> {
    let plane_len = dims[1] * dims[2];
    if plane.len() != plane_len {
        return Err(ShapeError::DataLength {
            len: plane.len(),
            shape: [1, dims[1], dims[2]],
        });
    }
    let data = plane.repeat(dims[0]);
    FeatureTensor::new(data, dims)
}

//! Post-normalization tensor transforms.
//!
//! Each step maps a tensor to a tensor of the same shape; the chain rejects a
//! step that changes the shape.

use serde::Deserialize;

use crate::shape::{FeatureTensor, ShapeError};

/// A transform applied to each tensor after shape normalization.
pub trait TensorTransform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError>;
}

/// Divide every value by a scale factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub factor: f32,
}

impl TensorTransform for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn apply(&self, mut tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError> {
        for v in &mut tensor.data {
            *v /= self.factor;
        }
        Ok(tensor)
    }
}

/// Standardize with a fixed mean and standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standardize {
    pub mean: f32,
    pub std: f32,
}

impl TensorTransform for Standardize {
    fn name(&self) -> &str {
        "standardize"
    }

    fn apply(&self, mut tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError> {
        for v in &mut tensor.data {
            *v = (*v - self.mean) / self.std;
        }
        Ok(tensor)
    }
}

/// `ln(max(x, floor))`, for power spectrograms computed without log scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogCompress {
    pub floor: f32,
}

impl TensorTransform for LogCompress {
    fn name(&self) -> &str {
        "log"
    }

    fn apply(&self, mut tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError> {
        for v in &mut tensor.data {
            *v = v.max(self.floor).ln();
        }
        Ok(tensor)
    }
}

/// Per-tensor min/max rescale to `[0, 1]`. Constant tensors become zeros.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MinMax;

impl TensorTransform for MinMax {
    fn name(&self) -> &str {
        "min_max"
    }

    fn apply(&self, mut tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError> {
        let (lo, hi) = tensor
            .data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = hi - lo;
        for v in &mut tensor.data {
            *v = if range > 0.0 { (*v - lo) / range } else { 0.0 };
        }
        Ok(tensor)
    }
}

/// Serializable description of one transform step.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransformStep {
    Scale { factor: f32 },
    Standardize { mean: f32, std: f32 },
    Log {
        #[serde(default = "default_floor")]
        floor: f32,
    },
    MinMax,
}

fn default_floor() -> f32 {
    1e-10
}

impl TransformStep {
    pub fn build(self) -> Box<dyn TensorTransform> {
        match self {
            TransformStep::Scale { factor } => Box::new(Scale { factor }),
            TransformStep::Standardize { mean, std } => Box::new(Standardize { mean, std }),
            TransformStep::Log { floor } => Box::new(LogCompress { floor }),
            TransformStep::MinMax => Box::new(MinMax),
        }
    }
}

/// Ordered chain of transforms.
#[derive(Default)]
pub struct TransformChain {
    steps: Vec<Box<dyn TensorTransform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: &[TransformStep]) -> Self {
        Self {
            steps: steps.iter().map(|s| s.build()).collect(),
        }
    }

    pub fn push<T: TensorTransform + 'static>(mut self, step: T) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, mut tensor: FeatureTensor) -> Result<FeatureTensor, ShapeError> {
        for step in &self.steps {
            let expected = tensor.shape;
            tensor = step.apply(tensor)?;
            if tensor.shape != expected || tensor.data.len() != expected.iter().product::<usize>() {
                return Err(ShapeError::ShapeChanged {
                    expected,
                    actual: tensor.shape,
                });
            }
        }
        Ok(tensor)
    }
}

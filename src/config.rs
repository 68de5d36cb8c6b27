//! Dataset and loader configuration, loadable from TOML.
//!
//! ```toml
//! metadata_path = "data/ff1010bird_metadata.csv"
//!
//! [split]
//! seed = 1994
//! ratio = 0.8
//! split = "train"
//!
//! [balance]
//! enabled = true
//!
//! [target]
//! channels = 3
//! freq_bins = 128
//! time_steps = 256
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::balance::BalanceConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataConfig;
use crate::shape::{CropPolicy, Layout, TargetShape};
use crate::spectrogram::SpectrogramConfig;
use crate::split::SplitConfig;
use crate::transform::TransformStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Resample decoded audio to this rate; `None` keeps the file's rate.
    pub sample_rate: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: Some(22050),
        }
    }
}

/// Everything needed to build a [`crate::dataset::SplitDataset`].
///
/// `metadata_path` and `split.seed` have no defaults in TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatasetConfig {
    pub metadata_path: PathBuf,
    #[serde(default)]
    pub metadata: MetadataConfig,
    pub split: SplitConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub spectrogram: SpectrogramConfig,
    #[serde(default)]
    pub target: TargetShape,
    #[serde(default)]
    pub policy: CropPolicy,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
}

impl DatasetConfig {
    pub fn new(metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            metadata_path: metadata_path.into(),
            metadata: MetadataConfig::default(),
            split: SplitConfig::default(),
            balance: BalanceConfig::default(),
            audio: AudioConfig::default(),
            spectrogram: SpectrogramConfig::default(),
            target: TargetShape::default(),
            policy: CropPolicy::default(),
            layout: Layout::default(),
            cache: CacheConfig::default(),
            transforms: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;
        self.spectrogram
            .validate()
            .map_err(|e| Error::config(e.to_string()))?;
        self.target.validate()?;
        if self.audio.sample_rate == Some(0) {
            return Err(Error::config("audio.sample_rate must be > 0"));
        }
        if self.cache.max_entries == Some(0) {
            return Err(Error::config("cache.max_entries must be > 0 when set"));
        }
        if self.spectrogram.n_bins() > self.target.freq_bins {
            return Err(Error::config(format!(
                "spectrogram produces {} bins but target.freq_bins is {}",
                self.spectrogram.n_bins(),
                self.target.freq_bins
            )));
        }
        Ok(())
    }
}

/// What the batch loader does with an item that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log and drop the item; the batch is assembled from the rest.
    #[default]
    Skip,
    /// Yield the error and stop the epoch.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub n_workers: usize,
    pub channel_size: usize,
    /// Drop a final batch smaller than `batch_size`.
    pub drop_last: bool,
    pub on_error: ErrorPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            n_workers: 4,
            channel_size: 64,
            drop_last: false,
            on_error: ErrorPolicy::Skip,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.n_workers == 0 {
            return Err(Error::config("n_workers must be > 0"));
        }
        if self.channel_size == 0 {
            return Err(Error::config("channel_size must be > 0"));
        }
        Ok(())
    }
}

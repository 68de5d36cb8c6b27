//! Split, balanced, cached audio dataset.
//!
//! Construction loads metadata, keeps the rows of one split, and optionally
//! balances classes within that split. The resulting table governs `len()`,
//! indexed access and cursor iteration. Each access decodes through the sound
//! cache, computes a spectrogram, fits it to the target shape and applies the
//! transform chain; tensors themselves are never cached.
//!
//! Random crops draw from a generator derived from `(seed, epoch, index)`, so
//! results do not depend on which thread asks for an item. `shuffle()` starts
//! a new epoch.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::balance::{balance, class_counts};
use crate::cache::SoundCache;
use crate::config::DatasetConfig;
use crate::decode::{CancelToken, Decoder, SymphoniaDecoder};
use crate::error::{Error, Result};
use crate::metadata::{load_metadata, Label, MetadataRecord};
use crate::shape::{FeatureTensor, ShapeNormalizer};
use crate::spectrogram::{Spectrogram, SpectrogramError, SpectrogramTransform};
use crate::split::{Split, SplitMask};
use crate::transform::TransformChain;

const SHUFFLE_STREAM: u64 = 0xA076_1D64_78BD_642F;
const CROP_STREAM: u64 = 0xE703_7ED1_A0B4_28DB;

/// `one_hot(k, n)`: length `n`, 1.0 at `k`, 0.0 elsewhere.
pub fn one_hot(class_index: usize, num_classes: usize) -> Result<Vec<f32>> {
    if class_index >= num_classes {
        return Err(Error::Index {
            index: class_index as i64,
            len: num_classes,
        });
    }
    let mut v = vec![0.0; num_classes];
    v[class_index] = 1.0;
    Ok(v)
}

/// One fully processed dataset entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetItem {
    pub tensor: FeatureTensor,
    pub label: Label,
    pub item_id: String,
    /// Position in the governing table.
    pub index: usize,
    /// First spectrogram frame of the emitted window.
    pub offset: usize,
}

impl DatasetItem {
    /// `(one_hot(index, num_items), one_hot(offset, max_location))`, the
    /// targets of the identity/location autoencoder pipeline.
    pub fn identity_targets(&self, num_items: usize, max_location: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((one_hot(self.index, num_items)?, one_hot(self.offset, max_location)?))
    }
}

pub struct SplitDataset {
    config: DatasetConfig,
    split_records: Vec<MetadataRecord>,
    records: Vec<MetadataRecord>,
    num_classes: usize,
    epoch: u64,
    cursor: usize,
    decoder: Arc<dyn Decoder>,
    cache: SoundCache,
    spectrogram: SpectrogramTransform,
    // Transforms for decoded rates other than the configured one
    native_spectrograms: Mutex<HashMap<u32, Arc<SpectrogramTransform>>>,
    normalizer: ShapeNormalizer,
    transforms: TransformChain,
}

impl SplitDataset {
    /// Load metadata from `config.metadata_path` and decode with symphonia.
    pub fn new(config: DatasetConfig) -> Result<Self> {
        let decoder = Arc::new(SymphoniaDecoder::new(config.audio.sample_rate));
        Self::with_decoder(config, decoder)
    }

    pub fn with_decoder(config: DatasetConfig, decoder: Arc<dyn Decoder>) -> Result<Self> {
        config.validate()?;
        let records = load_metadata(&config.metadata_path, &config.metadata)?;
        Self::from_records(records, config, decoder)
    }

    /// Build from an already-loaded metadata table.
    pub fn from_records(
        records: Vec<MetadataRecord>,
        mut config: DatasetConfig,
        decoder: Arc<dyn Decoder>,
    ) -> Result<Self> {
        config.validate()?;

        let mask = SplitMask::from_config(&config.split, records.len())?;
        let split_records = mask.select(&records, config.split.split);

        // Class count comes from the full table so train and test agree.
        let num_classes = match config.balance.num_classes {
            Some(n) => n,
            None => records
                .iter()
                .filter_map(|r| r.label.class())
                .max()
                .map_or(0, |max| (max.max(-1) + 1) as usize),
        };
        // A split lacking any of these classes cannot be balanced
        config.balance.num_classes = Some(num_classes);

        let table = if config.balance.enabled {
            balance(&split_records, &config.balance, config.split.seed)?
        } else {
            split_records.clone()
        };
        if table.is_empty() {
            warn!(split = ?config.split.split, rows = records.len(), "split selected no rows");
        }

        let spectrogram = SpectrogramTransform::new(
            config.spectrogram.clone(),
            config.audio.sample_rate.unwrap_or(22050),
        )
        .map_err(|e| Error::config(e.to_string()))?;
        let normalizer = ShapeNormalizer::new(config.target, config.policy, config.layout)?;
        let transforms = TransformChain::from_steps(&config.transforms);
        let cache = SoundCache::new(config.cache);

        info!(
            split = ?config.split.split,
            total = records.len(),
            selected = split_records.len(),
            len = table.len(),
            balanced = config.balance.enabled,
            "dataset constructed"
        );

        Ok(Self {
            config,
            split_records,
            records: table,
            num_classes,
            epoch: 0,
            cursor: 0,
            decoder,
            cache,
            spectrogram,
            native_spectrograms: Mutex::new(HashMap::new()),
            normalizer,
            transforms,
        })
    }

    /// Replace the transform chain applied after normalization.
    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn split(&self) -> Split {
        self.config.split.split
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Dimensions of every emitted tensor.
    pub fn tensor_dims(&self) -> [usize; 3] {
        self.normalizer.dims()
    }

    /// Governing table in iteration order.
    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    /// Rows of this split before balancing, in metadata order.
    pub fn split_records(&self) -> &[MetadataRecord] {
        &self.split_records
    }

    pub fn class_counts(&self) -> Result<BTreeMap<i64, usize>> {
        class_counts(&self.records)
    }

    pub fn cache(&self) -> &SoundCache {
        &self.cache
    }

    /// Map a possibly negative index to a valid position.
    pub fn resolve_index(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.len())
            .ok_or(Error::Index {
                index,
                len: self.len(),
            })
    }

    /// Permute the governing table and start a new epoch. The cache is untouched.
    pub fn shuffle(&mut self) {
        self.epoch += 1;
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.split.seed, self.epoch, SHUFFLE_STREAM));
        self.records.shuffle(&mut rng);
        debug!(epoch = self.epoch, "dataset shuffled");
    }

    /// Recompute the balanced table from this split's rows.
    pub fn rebalance(&mut self) -> Result<()> {
        let seed = self.config.split.seed.wrapping_add(self.epoch);
        self.records = balance(&self.split_records, &self.config.balance, seed)?;
        self.cursor = 0;
        Ok(())
    }

    pub fn get_item(&self, index: usize) -> Result<DatasetItem> {
        self.get_item_with(index, &CancelToken::new())
    }

    /// Like [`get_item`](Self::get_item), with a token that aborts the decode.
    pub fn get_item_with(&self, index: usize, cancel: &CancelToken) -> Result<DatasetItem> {
        let record = self.records.get(index).ok_or(Error::Index {
            index: index as i64,
            len: self.len(),
        })?;

        let spec = self.spectrogram_for(record, cancel)?;

        let mut rng = StdRng::seed_from_u64(derive_seed(
            self.config.split.seed ^ CROP_STREAM,
            self.epoch,
            index as u64,
        ));
        let normalized = self.normalizer.normalize(&spec, &mut rng)?;
        let tensor = self.normalizer.to_tensor(&normalized.matrix)?;
        let tensor = self.transforms.apply(tensor)?;

        Ok(DatasetItem {
            tensor,
            label: record.label.clone(),
            item_id: record.item_id.clone(),
            index,
            offset: normalized.offset,
        })
    }

    fn spectrogram_for(&self, record: &MetadataRecord, cancel: &CancelToken) -> Result<Spectrogram> {
        let audio = self
            .cache
            .get_or_decode(&record.item_id, || self.decoder.decode(&record.file_path, cancel))
            .map_err(|source| {
                warn!(
                    item_id = %record.item_id,
                    path = %record.file_path.display(),
                    error = %source,
                    "failed to load recording"
                );
                Error::Decode {
                    item_id: record.item_id.clone(),
                    source,
                }
            })?;

        let spec_err = |source| Error::Spectrogram {
            item_id: record.item_id.clone(),
            source,
        };
        if audio.sample_rate == self.spectrogram.sample_rate() {
            self.spectrogram.transform(&audio.samples).map_err(spec_err)
        } else {
            self.native_spectrogram(audio.sample_rate)
                .and_then(|t| t.transform(&audio.samples))
                .map_err(spec_err)
        }
    }

    fn native_spectrogram(&self, sample_rate: u32) -> std::result::Result<Arc<SpectrogramTransform>, SpectrogramError> {
        let mut by_rate = self
            .native_spectrograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(transform) = by_rate.get(&sample_rate) {
            return Ok(Arc::clone(transform));
        }
        debug!(sample_rate, "building spectrogram transform for native rate");
        let transform = Arc::new(SpectrogramTransform::new(self.config.spectrogram.clone(), sample_rate)?);
        by_rate.insert(sample_rate, Arc::clone(&transform));
        Ok(transform)
    }

    /// One-hot class vector for a class label.
    pub fn label_one_hot(&self, label: &Label) -> Result<Vec<f32>> {
        let class = label
            .class()
            .ok_or_else(|| Error::config("label is not a class code"))?;
        let index = usize::try_from(class).map_err(|_| Error::Index {
            index: class,
            len: self.num_classes,
        })?;
        one_hot(index, self.num_classes)
    }

    /// Next item under the internal cursor, or `None` once the cursor reaches `len()`.
    pub fn next_item(&mut self) -> Option<Result<DatasetItem>> {
        if self.cursor >= self.len() {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(self.get_item(index))
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Independent in-order traversal that leaves the internal cursor alone.
    pub fn iter(&self) -> Items<'_> {
        Items {
            dataset: self,
            pos: 0,
        }
    }
}

pub struct Items<'a> {
    dataset: &'a SplitDataset,
    pos: usize,
}

impl Iterator for Items<'_> {
    type Item = Result<DatasetItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.dataset.len() {
            return None;
        }
        let item = self.dataset.get_item(self.pos);
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.dataset.len() - self.pos;
        (rest, Some(rest))
    }
}

fn derive_seed(seed: u64, epoch: u64, stream: u64) -> u64 {
    splitmix64(seed ^ splitmix64(epoch ^ stream.wrapping_mul(0xD6E8_FEB8_6659_FD93)))
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

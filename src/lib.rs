//! Audio dataset pipeline for spectrogram classifiers.
//!
//! - Metadata tables read with the arrow CSV reader
//! - Seeded train/test split masks and class-balancing upsampling
//! - Audio decoding (symphonia) behind a per-item memoizing cache
//! - Spectrogram computation (FFT -> mel power / log-mel)
//! - Crop/pad to a fixed `(channels, freq, time)` tensor shape
//! - Multi-threaded batch loading in dataset order

pub mod balance;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod error;
pub mod loader;
pub mod metadata;
pub mod shape;
pub mod spectrogram;
pub mod split;
pub mod transform;

pub use cache::{CacheConfig, SoundCache};
pub use config::{AudioConfig, DatasetConfig, ErrorPolicy, LoaderConfig};
pub use dataset::{one_hot, DatasetItem, SplitDataset};
pub use decode::{CancelToken, DecodeError, DecodedAudio, Decoder, SymphoniaDecoder};
pub use error::{Error, Result};
pub use loader::{Batch, BatchLoader};
pub use metadata::{load_metadata, Label, MetadataConfig, MetadataRecord};
pub use shape::{CropPolicy, FeatureTensor, Layout, ShapeError, ShapeNormalizer, TargetShape};
pub use spectrogram::{Spectrogram, SpectrogramConfig, SpectrogramError, SpectrogramTransform};
pub use split::{Split, SplitConfig, SplitMask};
pub use transform::{TensorTransform, TransformChain, TransformStep};

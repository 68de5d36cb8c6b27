//! Crate-level error type.
//!
//! Per-item failures (`Decode`, `Spectrogram`, `Shape`) carry the offending
//! item id so the caller can log it and pick a skip/abort policy.
//! `Config` and `Metadata` surface at construction time, before any iteration.

use thiserror::Error;

use crate::decode::DecodeError;
use crate::metadata::MetadataError;
use crate::shape::ShapeError;
use crate::spectrogram::SpectrogramError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode failed for item {item_id}: {source}")]
    Decode {
        item_id: String,
        #[source]
        source: DecodeError,
    },
    #[error("spectrogram failed for item {item_id}: {source}")]
    Spectrogram {
        item_id: String,
        #[source]
        source: SpectrogramError,
    },
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("index {index} out of range for dataset of length {len}")]
    Index { index: i64, len: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Item id attached to a per-item failure, if any.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Error::Decode { item_id, .. } | Error::Spectrogram { item_id, .. } => Some(item_id),
            _ => None,
        }
    }
}

//! Metadata table reading (CSV via arrow).
//!
//! One row per recording. Audio paths are derived from the item id and the
//! metadata file location: `<dir>/<stem>_metadata.csv` maps to
//! `<dir>/<stem>_wav/<item_id>.wav`. Paths are not checked here; a missing
//! file surfaces on first decode.

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const METADATA_SUFFIX: &str = "_metadata.csv";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("Missing column: {0}")]
    MissingColumn(String),
    #[error("Invalid value in column {column} at row {row}")]
    InvalidValue { column: String, row: usize },
    #[error("Duplicate item id: {0}")]
    DuplicateId(String),
    #[error("Cannot derive audio directory from {0}; set audio_dir explicitly")]
    NoAudioDir(PathBuf),
}

/// Target of a record: a class code, or the recording itself for
/// self-supervised pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Class(i64),
    Source(PathBuf),
}

impl Label {
    pub fn class(&self) -> Option<i64> {
        match self {
            Label::Class(c) => Some(*c),
            Label::Source(_) => None,
        }
    }
}

/// A single row of the metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub item_id: String,
    pub label: Label,
    pub file_path: PathBuf,
}

/// How metadata columns and audio paths are resolved.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub id_column: String,
    /// `None` labels every record with its own file path.
    pub label_column: Option<String>,
    /// Overrides the `<stem>_wav` sibling directory convention.
    pub audio_dir: Option<PathBuf>,
    pub extension: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            id_column: "itemid".to_string(),
            label_column: Some("hasbird".to_string()),
            audio_dir: None,
            extension: "wav".to_string(),
        }
    }
}

impl MetadataConfig {
    /// Directory holding the audio files for `metadata_path`.
    pub fn audio_root(&self, metadata_path: &Path) -> Result<PathBuf, MetadataError> {
        if let Some(dir) = &self.audio_dir {
            return Ok(dir.clone());
        }
        let name = metadata_path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.ends_with(METADATA_SUFFIX))
            .ok_or_else(|| MetadataError::NoAudioDir(metadata_path.to_path_buf()))?;
        let stem = &name[..name.len() - METADATA_SUFFIX.len()];
        let parent = metadata_path.parent().unwrap_or_else(|| Path::new(""));
        Ok(parent.join(format!("{stem}_wav")))
    }

    pub fn file_path(&self, root: &Path, item_id: &str) -> PathBuf {
        root.join(format!("{item_id}.{}", self.extension))
    }
}

/// Read every record from the CSV file at `path`.
pub fn load_metadata(path: &Path, config: &MetadataConfig) -> Result<Vec<MetadataRecord>, MetadataError> {
    let root = config.audio_root(path)?;

    let mut file = File::open(path)?;
    let format = Format::default().with_header(true);
    let (schema, _) = format.infer_schema(&mut file, None)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = ReaderBuilder::new(Arc::new(schema))
        .with_header(true)
        .build(file)?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let offset = records.len();
        extract_records(&batch, config, &root, offset, &mut records)?;
    }

    check_unique(&records)?;
    Ok(records)
}

fn check_unique(records: &[MetadataRecord]) -> Result<(), MetadataError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.item_id.as_str()) {
            return Err(MetadataError::DuplicateId(record.item_id.clone()));
        }
    }
    Ok(())
}

fn column(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<ArrayRef, MetadataError> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| MetadataError::MissingColumn(name.to_string()))?;
    Ok(cast(col, data_type)?)
}

fn extract_records(
    batch: &RecordBatch,
    config: &MetadataConfig,
    root: &Path,
    row_offset: usize,
    out: &mut Vec<MetadataRecord>,
) -> Result<(), MetadataError> {
    let ids = column(batch, &config.id_column, &DataType::Utf8)?;
    let ids = ids
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| MetadataError::MissingColumn(config.id_column.clone()))?;

    let labels = match &config.label_column {
        Some(name) => Some(column(batch, name, &DataType::Int64)?),
        None => None,
    };
    let labels = match &labels {
        Some(col) => Some(
            col.as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| MetadataError::MissingColumn(config.label_column.clone().unwrap_or_default()))?,
        ),
        None => None,
    };

    for row in 0..batch.num_rows() {
        if ids.is_null(row) {
            return Err(MetadataError::InvalidValue {
                column: config.id_column.clone(),
                row: row_offset + row,
            });
        }
        let item_id = ids.value(row).trim().to_string();
        let file_path = config.file_path(root, &item_id);

        let label = match labels {
            Some(col) if col.is_null(row) => {
                return Err(MetadataError::InvalidValue {
                    column: config.label_column.clone().unwrap_or_default(),
                    row: row_offset + row,
                });
            }
            Some(col) => Label::Class(col.value(row)),
            None => Label::Source(file_path.clone()),
        };

        out.push(MetadataRecord {
            item_id,
            label,
            file_path,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_with_sibling_audio_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "ff1010bird_metadata.csv",
            "itemid,hasbird\n64486,0\n2525,1\n44981,0\n",
        );

        let records = load_metadata(&path, &MetadataConfig::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].item_id, "64486");
        assert_eq!(records[1].label, Label::Class(1));
        assert_eq!(
            records[2].file_path,
            dir.path().join("ff1010bird_wav").join("44981.wav")
        );
    }

    #[test]
    fn test_source_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "songs_metadata.csv", "itemid\nintro\noutro\n");
        let config = MetadataConfig {
            label_column: None,
            ..Default::default()
        };

        let records = load_metadata(&path, &config).unwrap();
        assert_eq!(
            records[1].label,
            Label::Source(dir.path().join("songs_wav").join("outro.wav"))
        );
    }

    #[test]
    fn test_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "x_metadata.csv", "itemid,hasbird\n1,0\n1,1\n");
        let err = load_metadata(&path, &MetadataConfig::default()).unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateId(id) if id == "1"));
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "x_metadata.csv", "itemid,label\n1,0\n");
        let err = load_metadata(&path, &MetadataConfig::default()).unwrap_err();
        assert!(matches!(err, MetadataError::MissingColumn(c) if c == "hasbird"));
    }

    #[test]
    fn test_audio_dir_override() {
        let config = MetadataConfig {
            audio_dir: Some(PathBuf::from("/data/clips")),
            extension: "flac".to_string(),
            ..Default::default()
        };
        let root = config.audio_root(Path::new("anything.csv")).unwrap();
        assert_eq!(config.file_path(&root, "7"), PathBuf::from("/data/clips/7.flac"));
    }

    #[test]
    fn test_unconventional_name_needs_audio_dir() {
        let err = MetadataConfig::default()
            .audio_root(Path::new("/data/table.csv"))
            .unwrap_err();
        assert!(matches!(err, MetadataError::NoAudioDir(_)));
    }
}

//! Multi-threaded batch loader over a [`SplitDataset`].
//!
//! Architecture:
//! Feeder Thread -> Index Channel -> Worker Threads -> Result Channel -> Main Thread
//!
//! - Feeder sends dataset positions in order
//! - Workers call `get_item`, sharing the dataset's sound cache
//! - Main thread reorders results by position and assembles batches, so batch
//!   contents do not depend on worker count or scheduling
//! - The feeder spends one credit per position and the main thread returns a
//!   credit each time the next position is consumed, so at most
//!   `channel_size + n_workers` positions are in flight or waiting for reorder
//!
//! Dropping the loader cancels in-flight decodes and joins every thread.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ErrorPolicy, LoaderConfig};
use crate::dataset::{DatasetItem, SplitDataset};
use crate::decode::CancelToken;
use crate::error::Result;
use crate::metadata::Label;

const POLL: Duration = Duration::from_millis(100);

type Indexed = (usize, Result<DatasetItem>);

/// A batch of equally shaped tensors, stacked row-major as `[B, C, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
    pub labels: Vec<Label>,
    pub item_ids: Vec<String>,
    pub indices: Vec<usize>,
    pub offsets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    /// Tensor data of the `i`-th sample.
    pub fn sample(&self, i: usize) -> &[f32] {
        let n: usize = self.shape[1..].iter().product();
        &self.data[i * n..(i + 1) * n]
    }
}

/// One pass over a dataset, yielding batches in dataset order.
pub struct BatchLoader {
    config: LoaderConfig,
    dims: [usize; 3],
    len: usize,
    result_rx: Receiver<Indexed>,
    pending: BTreeMap<usize, Result<DatasetItem>>,
    credit_tx: Sender<()>,
    window: usize,
    next_pos: usize,
    finished: bool,
    shutdown: CancelToken,
    feeder_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<SplitDataset>, config: LoaderConfig) -> Result<Self> {
        config.validate()?;

        let len = dataset.len();
        let dims = dataset.tensor_dims();
        let shutdown = CancelToken::new();
        let (index_tx, index_rx) = bounded(config.channel_size);
        let (result_tx, result_rx) = bounded(config.channel_size);

        let window = config.channel_size + config.n_workers;
        let (credit_tx, credit_rx) = bounded(window);
        for _ in 0..window {
            let _ = credit_tx.try_send(());
        }

        let feeder_handle = {
            let shutdown = shutdown.clone();
            thread::spawn(move || feeder_thread_main(len, index_tx, credit_rx, shutdown))
        };

        let worker_handles = (0..config.n_workers)
            .map(|_| {
                let dataset = Arc::clone(&dataset);
                let index_rx = index_rx.clone();
                let result_tx = result_tx.clone();
                let shutdown = shutdown.clone();
                thread::spawn(move || worker_thread_main(dataset, index_rx, result_tx, shutdown))
            })
            .collect();

        debug!(len, workers = config.n_workers, batch_size = config.batch_size, "loader started");

        Ok(Self {
            config,
            dims,
            len,
            result_rx,
            pending: BTreeMap::new(),
            credit_tx,
            window,
            next_pos: 0,
            finished: false,
            shutdown,
            feeder_handle: Some(feeder_handle),
            worker_handles,
        })
    }

    /// Number of batches this pass will yield if no item fails.
    pub fn num_batches(&self) -> usize {
        let full = self.len / self.config.batch_size;
        if self.config.drop_last || self.len % self.config.batch_size == 0 {
            full
        } else {
            full + 1
        }
    }

    /// Result for the next dataset position, waiting for workers as needed.
    fn next_result(&mut self) -> Option<Result<DatasetItem>> {
        if self.next_pos >= self.len {
            return None;
        }
        loop {
            if let Some(result) = self.pending.remove(&self.next_pos) {
                self.next_pos += 1;
                let _ = self.credit_tx.try_send(());
                return Some(result);
            }
            match self.result_rx.recv_timeout(POLL) {
                Ok((pos, result)) => {
                    self.pending.insert(pos, result);
                    debug_assert!(self.pending.len() <= self.window);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn stop_pipeline(&mut self) {
        self.shutdown.cancel();

        if let Some(h) = self.feeder_handle.take() {
            let _ = h.join();
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
    }

    fn assemble_batch(&self, items: Vec<DatasetItem>) -> Batch {
        let batch_size = items.len();
        let sample_len: usize = self.dims.iter().product();

        let mut batch = Batch {
            data: Vec::with_capacity(batch_size * sample_len),
            shape: [batch_size, self.dims[0], self.dims[1], self.dims[2]],
            labels: Vec::with_capacity(batch_size),
            item_ids: Vec::with_capacity(batch_size),
            indices: Vec::with_capacity(batch_size),
            offsets: Vec::with_capacity(batch_size),
        };

        for item in items {
            batch.data.extend_from_slice(&item.tensor.data);
            batch.labels.push(item.label);
            batch.item_ids.push(item.item_id);
            batch.indices.push(item.index);
            batch.offsets.push(item.offset);
        }

        batch
    }
}

impl Iterator for BatchLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut items = Vec::with_capacity(self.config.batch_size);
        while items.len() < self.config.batch_size {
            match self.next_result() {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => match self.config.on_error {
                    ErrorPolicy::Skip => {
                        warn!(item_id = e.item_id().unwrap_or("-"), error = %e, "skipping item");
                    }
                    ErrorPolicy::Abort => {
                        self.finished = true;
                        self.stop_pipeline();
                        return Some(Err(e));
                    }
                },
                None => break,
            }
        }

        if items.is_empty() || (self.config.drop_last && items.len() < self.config.batch_size) {
            self.finished = true;
            return None;
        }

        Some(Ok(self.assemble_batch(items)))
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}

// --- Feeder Thread ---

fn feeder_thread_main(len: usize, index_tx: Sender<usize>, credit_rx: Receiver<()>, shutdown: CancelToken) {
    for pos in 0..len {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match credit_rx.recv_timeout(POLL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        let mut pending = pos;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match index_tx.send_timeout(pending, POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => pending = returned,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

// --- Worker Thread ---

fn worker_thread_main(
    dataset: Arc<SplitDataset>,
    index_rx: Receiver<usize>,
    result_tx: Sender<Indexed>,
    shutdown: CancelToken,
) {
    loop {
        let pos = match index_rx.recv_timeout(POLL) {
            Ok(p) => p,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.is_cancelled() {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut message = (pos, dataset.get_item_with(pos, &shutdown));
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match result_tx.send_timeout(message, POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => message = returned,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;
    use crate::decode::{DecodeError, DecodedAudio, Decoder};
    use crate::error::Error;
    use crate::metadata::MetadataRecord;
    use crate::shape::TargetShape;
    use crate::spectrogram::SpectrogramConfig;
    use std::path::{Path, PathBuf};

    /// Noise-free ramp clips; any path containing "broken" fails.
    struct RampDecoder;

    impl Decoder for RampDecoder {
        fn decode(&self, path: &Path, cancel: &CancelToken) -> std::result::Result<DecodedAudio, DecodeError> {
            if cancel.is_cancelled() {
                return Err(DecodeError::Cancelled);
            }
            if path.to_string_lossy().contains("broken") {
                return Err(DecodeError::Empty);
            }
            Ok(DecodedAudio::mono(
                (0..8000).map(|i| ((i % 97) as f32 / 97.0) - 0.5).collect(),
                16000,
            ))
        }
    }

    fn dataset(n: usize, broken: &[usize]) -> Arc<SplitDataset> {
        let records = (0..n)
            .map(|i| {
                let name = if broken.contains(&i) {
                    format!("broken{i}")
                } else {
                    format!("clip{i}")
                };
                MetadataRecord {
                    item_id: name.clone(),
                    label: Label::Class((i % 2) as i64),
                    file_path: PathBuf::from(format!("{name}.wav")),
                }
            })
            .collect();

        let mut config = DatasetConfig::new("loader_metadata.csv");
        config.split.ratio = 0.999_999;
        config.audio.sample_rate = Some(16000);
        config.spectrogram = SpectrogramConfig::bird_calls(32);
        config.spectrogram.n_fft = 256;
        config.spectrogram.hop_length = 128;
        config.target = TargetShape::new(1, 32, 20);

        Arc::new(SplitDataset::from_records(records, config, Arc::new(RampDecoder)).unwrap())
    }

    fn loader_config(batch_size: usize, n_workers: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            n_workers,
            channel_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_batches_in_dataset_order() {
        let ds = dataset(10, &[]);
        let loader = BatchLoader::new(Arc::clone(&ds), loader_config(4, 3)).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].shape, [4, 1, 32, 20]);
        assert_eq!(batches[2].len(), 2);

        let indices: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(batches[1].sample(0).len(), 32 * 20);
    }

    #[test]
    fn test_worker_count_does_not_change_batches() {
        let ds = dataset(9, &[]);
        let one: Vec<Batch> = BatchLoader::new(Arc::clone(&ds), loader_config(3, 1))
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        let many: Vec<Batch> = BatchLoader::new(Arc::clone(&ds), loader_config(3, 4))
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(one, many);
    }

    #[test]
    fn test_drop_last() {
        let ds = dataset(10, &[]);
        let config = LoaderConfig {
            drop_last: true,
            ..loader_config(4, 2)
        };
        let loader = BatchLoader::new(ds, config).unwrap();
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.count(), 2);
    }

    #[test]
    fn test_skip_failed_items() {
        let ds = dataset(6, &[1, 4]);
        let batches: Vec<Batch> = BatchLoader::new(ds, loader_config(2, 2))
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        let ids: Vec<String> = batches.iter().flat_map(|b| b.item_ids.clone()).collect();
        assert_eq!(ids, vec!["clip0", "clip2", "clip3", "clip5"]);
    }

    #[test]
    fn test_abort_on_error() {
        let ds = dataset(6, &[3]);
        let config = LoaderConfig {
            on_error: ErrorPolicy::Abort,
            ..loader_config(2, 2)
        };
        let mut loader = BatchLoader::new(ds, config).unwrap();

        assert!(loader.next().unwrap().is_ok());
        let err = loader.next().unwrap().unwrap_err();
        assert!(matches!(&err, Error::Decode { item_id, .. } if item_id == "broken3"));
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_early_drop_joins_threads() {
        let ds = dataset(50, &[]);
        let mut loader = BatchLoader::new(Arc::clone(&ds), loader_config(2, 4)).unwrap();
        assert!(loader.next().unwrap().is_ok());
        drop(loader);
        // Only this handle remains once every worker has exited
        assert_eq!(Arc::strong_count(&ds), 1);
    }

    /// Holds `clip0` until released; every other clip decodes at once.
    struct GatedDecoder {
        release: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Decoder for GatedDecoder {
        fn decode(&self, path: &Path, cancel: &CancelToken) -> std::result::Result<DecodedAudio, DecodeError> {
            if path.to_string_lossy().contains("clip0.") {
                while !self.release.load(std::sync::atomic::Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        return Err(DecodeError::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            RampDecoder.decode(path, cancel)
        }
    }

    #[test]
    fn test_stalled_position_bounds_reorder_window() {
        let release = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let records = (0..40)
            .map(|i| MetadataRecord {
                item_id: format!("clip{i}"),
                label: Label::Class((i % 2) as i64),
                file_path: PathBuf::from(format!("clip{i}.wav")),
            })
            .collect();
        let mut config = DatasetConfig::new("loader_metadata.csv");
        config.split.ratio = 0.999_999;
        config.audio.sample_rate = Some(16000);
        config.spectrogram = SpectrogramConfig::bird_calls(32);
        config.spectrogram.n_fft = 256;
        config.spectrogram.hop_length = 128;
        config.target = TargetShape::new(1, 32, 20);
        let decoder = Arc::new(GatedDecoder {
            release: Arc::clone(&release),
        });
        let ds = Arc::new(SplitDataset::from_records(records, config, decoder).unwrap());

        // channel_size 4 + 2 workers
        let mut loader = BatchLoader::new(Arc::clone(&ds), loader_config(4, 2)).unwrap();
        let watcher = {
            let ds = Arc::clone(&ds);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                let started = ds.cache().decode_count();
                release.store(true, std::sync::atomic::Ordering::SeqCst);
                started
            })
        };

        assert_eq!(loader.next().unwrap().unwrap().indices, vec![0, 1, 2, 3]);
        let started_while_stalled = watcher.join().unwrap();
        assert!(started_while_stalled <= 6, "{started_while_stalled} decodes started");
        assert_eq!(loader.map(|b| b.unwrap().len()).sum::<usize>(), 36);
    }

    #[test]
    fn test_empty_dataset() {
        let ds = dataset(0, &[]);
        let mut loader = BatchLoader::new(ds, loader_config(4, 2)).unwrap();
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_invalid_config() {
        let ds = dataset(2, &[]);
        assert!(matches!(
            BatchLoader::new(ds, loader_config(0, 1)),
            Err(Error::Config(_))
        ));
    }
}

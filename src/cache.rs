//! Memoizing cache of decoded audio, keyed by item id.
//!
//! Each key owns a slot mutex, so concurrent requests for the same item wait
//! on one decode instead of racing. A failed or cancelled decode leaves the
//! slot empty; nothing partial is ever visible to later reads.

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::decode::{DecodeError, DecodedAudio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of decoded items kept. `None` keeps everything for the
    /// lifetime of the cache.
    pub max_entries: Option<usize>,
}

type Slot = Arc<Mutex<Option<Arc<DecodedAudio>>>>;

#[derive(Default)]
struct CacheInner {
    slots: HashMap<String, Slot>,
    // Filled keys, oldest first
    order: VecDeque<String>,
}

/// Thread-safe decoded-audio cache.
pub struct SoundCache {
    inner: Mutex<CacheInner>,
    max_entries: Option<usize>,
    decodes: AtomicUsize,
}

impl SoundCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: config.max_entries,
            decodes: AtomicUsize::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(CacheConfig::default())
    }

    fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached audio for `item_id`, calling `decode` on a miss.
    ///
    /// Repeated hits return the same `Arc`. Errors are propagated and not cached.
    pub fn get_or_decode<F>(&self, item_id: &str, decode: F) -> Result<Arc<DecodedAudio>, DecodeError>
    where
        F: FnOnce() -> Result<DecodedAudio, DecodeError>,
    {
        let slot = Arc::clone(
            self.lock_inner()
                .slots
                .entry(item_id.to_string())
                .or_default(),
        );

        // Held across the decode: same-key callers wait here
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(audio) = guard.as_ref() {
            return Ok(Arc::clone(audio));
        }

        debug!(item_id, "sound cache miss");
        let n = self.decodes.fetch_add(1, Ordering::Relaxed);
        if n % 100 == 0 {
            info!(item_id, decoded = n + 1, "decoding audio");
        }

        let audio = match decode() {
            Ok(audio) => Arc::new(audio),
            Err(e) => {
                warn!(item_id, error = %e, "decode failed");
                drop(guard);
                self.discard_empty(item_id, &slot);
                return Err(e);
            }
        };
        *guard = Some(Arc::clone(&audio));
        drop(guard);

        self.record_insert(item_id);
        Ok(audio)
    }

    fn record_insert(&self, item_id: &str) {
        let mut inner = self.lock_inner();
        inner.order.push_back(item_id.to_string());

        if let Some(max) = self.max_entries {
            while inner.order.len() > max {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.slots.remove(&oldest);
                debug!(item_id = %oldest, "sound cache evicted");
            }
        }
    }

    // Drop the slot created for a failed decode unless someone filled it since.
    fn discard_empty(&self, item_id: &str, slot: &Slot) {
        let mut inner = self.lock_inner();
        let unused = inner
            .slots
            .get(item_id)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(s) <= 2);
        if unused {
            inner.slots.remove(item_id);
        }
    }

    /// Cached audio for `item_id` without decoding.
    pub fn get(&self, item_id: &str) -> Option<Arc<DecodedAudio>> {
        let slot = self.lock_inner().slots.get(item_id).cloned()?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.get(item_id).is_some()
    }

    /// Number of filled entries.
    pub fn len(&self) -> usize {
        self.lock_inner().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total decodes started over the cache lifetime.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.slots.clear();
        inner.order.clear();
    }
}

impl Default for SoundCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

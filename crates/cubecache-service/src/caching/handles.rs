use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::CubeError;
use crate::source::{CubeShape, DataSource, Precomputed, Slice, SourceOpener};
use crate::types::{ChannelOrAll, DataKind, SourceKey};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An opened data source.
///
/// All reads through one handle are serialized by its I/O lock, no matter how many jobs share
/// the handle.
pub struct SourceHandle {
    id: u64,
    key: SourceKey,
    shape: CubeShape,
    source: Arc<dyn DataSource>,
    io: Mutex<()>,
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("shape", &self.shape)
            .finish()
    }
}

impl SourceHandle {
    pub fn new(key: SourceKey, source: Arc<dyn DataSource>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            key,
            shape: source.shape(),
            source,
            io: Mutex::new(()),
        }
    }

    /// A process-unique id, which changes whenever a source is reopened.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn shape(&self) -> CubeShape {
        self.shape
    }

    pub fn has_changed(&self) -> bool {
        self.source.has_changed()
    }

    pub fn has_swizzled(&self) -> bool {
        self.source.has_swizzled()
    }

    pub fn beam_area(&self) -> Option<f64> {
        self.source.beam_area()
    }

    pub fn read_slice(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        slice.validate(&self.shape)?;
        let _io = self.io.lock().unwrap();
        self.source.read_slice(slice)
    }

    pub fn read_swizzled(&self, slice: &Slice) -> Result<Vec<f32>, CubeError> {
        slice.validate(&self.shape)?;
        let _io = self.io.lock().unwrap();
        self.source.read_swizzled(slice)
    }

    pub fn has_precomputed_stats(&self, kind: DataKind) -> bool {
        self.source.has_precomputed_stats(kind)
    }

    pub fn read_precomputed_stats(
        &self,
        kind: DataKind,
        polarization: usize,
        channel: ChannelOrAll,
        num_bins: u32,
    ) -> Result<Option<Precomputed>, CubeError> {
        let _io = self.io.lock().unwrap();
        self.source
            .read_precomputed_stats(kind, polarization, channel, num_bins)
    }
}

/// A bounded cache of open data sources.
pub struct SourceHandleCache {
    opener: Arc<dyn SourceOpener>,
    handles: Mutex<LruCache<SourceKey, Arc<SourceHandle>>>,
}

impl fmt::Debug for SourceHandleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handles = self.handles.lock().unwrap();
        f.debug_struct("SourceHandleCache")
            .field("len", &handles.len())
            .field("capacity", &handles.cap())
            .finish()
    }
}

impl SourceHandleCache {
    pub fn new(opener: Arc<dyn SourceOpener>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            opener,
            handles: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns an open handle for `key`, opening the source if needed.
    ///
    /// A cached handle whose source changed since it was opened is replaced by a freshly opened
    /// one. Neither the change check nor opening runs under the cache lock, so slow I/O on one
    /// source does not block access to the others. When opening fails, nothing is cached.
    pub fn get(&self, key: &SourceKey) -> Result<Arc<SourceHandle>, CubeError> {
        let cached = self.handles.lock().unwrap().get(key).cloned();
        match cached {
            Some(handle) if !handle.has_changed() => {
                metric!(counter("handles.hit") += 1);
                return Ok(handle);
            }
            Some(stale) => {
                tracing::debug!(%key, "source changed, reopening");
                metric!(counter("handles.stale") += 1);
                let mut handles = self.handles.lock().unwrap();
                if handles.peek(key).is_some_and(|current| Arc::ptr_eq(current, &stale)) {
                    handles.pop(key);
                }
            }
            None => metric!(counter("handles.miss") += 1),
        }

        let source = self.opener.open(key)?;
        let fresh = Arc::new(SourceHandle::new(key.clone(), source));

        // Another caller may have opened the same source in the meantime.
        let raced = self.handles.lock().unwrap().peek(key).cloned();
        if let Some(existing) = raced {
            if !existing.has_changed() {
                self.handles.lock().unwrap().promote(key);
                return Ok(existing);
            }
        }

        let mut handles = self.handles.lock().unwrap();
        if let Some((evicted, _)) = handles.push(key.clone(), Arc::clone(&fresh)) {
            if evicted != *key {
                tracing::debug!(key = %evicted, "evicted source handle");
                metric!(counter("handles.evict") += 1);
            }
        }
        Ok(fresh)
    }

    /// Closes the handle for `key`, if it is cached.
    ///
    /// Jobs that still hold the handle keep it alive until they finish.
    pub fn remove(&self, key: &SourceKey) -> bool {
        self.handles.lock().unwrap().pop(key).is_some()
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.handles.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<SourceKey> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

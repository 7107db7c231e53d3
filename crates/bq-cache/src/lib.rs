//! The Table Cache (§4.4): a bounded set of fixed-size cached tables
//! addressed by backend offset, with LRU-ish eviction and inter-cache
//! flush-dependency ordering. A client of the queue in deployment, but its
//! own public contract never mentions the queue.

mod entry;

use std::collections::HashMap;
use std::sync::Arc;

use bq_backend::Backend;
use bq_error::{QueueError, Result, ENOSPC};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use entry::{Entry, ReadStatus};

struct Inner {
    entries: HashMap<u64, Entry>,
    depends: Option<TableCache>,
    hit_clock: u64,
}

struct Shared {
    backend: Arc<dyn Backend>,
    table_size: usize,
    capacity: usize,
    inner: Mutex<Inner>,
}

/// A bounded cache of fixed-size tables backed by one device (§4.4).
///
/// Cheaply cloneable: clones share the same entries, which is what lets a
/// [`CacheRef`] guard call back into the cache to unpin on drop.
#[derive(Clone)]
pub struct TableCache(Arc<Shared>);

impl TableCache {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, table_size: usize, capacity: usize) -> Self {
        Self(Arc::new(Shared {
            backend,
            table_size,
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                depends: None,
                hit_clock: 0,
            }),
        }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Establish "flush `dependency` before self" (§4.4). If a different
    /// dependency was already set, it is flushed first.
    pub fn set_dependency(&self, dependency: Self) -> Result<()> {
        let existing = self.0.inner.lock().depends.replace(dependency);
        if let Some(old) = existing {
            debug!("replacing table cache dependency, flushing the old one first");
            old.flush()?;
        }
        Ok(())
    }

    /// `get(offset)` (§4.4): returns a pinned [`CacheRef`], fetching from the
    /// backend and possibly evicting another entry as needed.
    pub fn get(&self, offset: u64) -> Result<CacheRef> {
        {
            let mut inner = self.0.inner.lock();
            inner.hit_clock += 1;
            let hits = inner.hit_clock;
            if let Some(entry) = inner.entries.get_mut(&offset) {
                entry.ref_count += 1;
                entry.hits = hits;
                trace!(offset, "table cache hit");
                return Ok(CacheRef {
                    cache: self.clone(),
                    offset,
                });
            }
        }

        self.ensure_capacity()?;

        let data = self.0.backend.sync_pread(offset, self.0.table_size)?;
        let mut inner = self.0.inner.lock();
        inner.hit_clock += 1;
        let hits = inner.hit_clock;
        debug!(offset, "table cache miss, fetched from backend");
        inner.entries.insert(offset, Entry::new(offset, data, hits));
        drop(inner);
        Ok(CacheRef {
            cache: self.clone(),
            offset,
        })
    }

    fn ensure_capacity(&self) -> Result<()> {
        loop {
            let victim = {
                let inner = self.0.inner.lock();
                if inner.entries.len() < self.0.capacity {
                    return Ok(());
                }
                inner
                    .entries
                    .values()
                    .filter(|e| e.ref_count == 0)
                    .min_by_key(|e| e.hits)
                    .map(|e| e.offset)
            };
            let Some(offset) = victim else {
                warn!("table cache full, no unpinned entry to evict");
                return Err(QueueError::CacheFull);
            };
            self.flush_dependency()?;
            self.flush_entry(offset)?;
            self.0.inner.lock().entries.remove(&offset);
            trace!(offset, "evicted table cache entry");
        }
    }

    fn flush_dependency(&self) -> Result<()> {
        let dep = self.0.inner.lock().depends.clone();
        if let Some(dep) = dep {
            dep.flush()?;
        }
        Ok(())
    }

    fn flush_entry(&self, offset: u64) -> Result<()> {
        let (dirty, data) = {
            let inner = self.0.inner.lock();
            match inner.entries.get(&offset) {
                Some(e) => (e.dirty, e.data.clone()),
                None => return Ok(()),
            }
        };
        if !dirty {
            return Ok(());
        }

        if let Some(e) = self.0.inner.lock().entries.get_mut(&offset) {
            e.status = ReadStatus::Reading; // reused here as "write in flight"
        }

        let ret = blocking_pwrite(&self.0.backend, offset, data);

        let mut inner = self.0.inner.lock();
        if let Some(e) = inner.entries.get_mut(&offset) {
            e.status = ReadStatus::Ready;
            if e.keep_dirty {
                e.keep_dirty = false;
            } else {
                e.dirty = false;
            }
        }
        drop(inner);
        if ret < 0 {
            return Err(QueueError::from_backend_code(ret as i32, ENOSPC));
        }
        Ok(())
    }

    /// `flush` (§4.4): flush every dirty entry, then issue a backend flush.
    /// The `depends` chain, if any, is flushed before self.
    pub fn flush(&self) -> Result<()> {
        self.flush_dependency()?;
        let offsets: Vec<u64> = self.0.inner.lock().entries.keys().copied().collect();
        for offset in offsets {
            self.flush_entry(offset)?;
        }
        let ret = blocking_flush(&self.0.backend);
        if ret < 0 {
            return Err(QueueError::from_backend_code(ret as i32, ENOSPC));
        }
        Ok(())
    }

    fn put(&self, offset: u64) {
        let mut inner = self.0.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&offset) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    fn mark_dirty(&self, offset: u64) {
        let mut inner = self.0.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&offset) {
            if entry.status == ReadStatus::Reading {
                entry.keep_dirty = true;
            }
            entry.dirty = true;
        }
    }

    fn write_into(&self, offset: u64, at: usize, bytes: &[u8]) {
        let mut inner = self.0.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&offset) {
            entry.data[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn read_from(&self, offset: u64) -> Vec<u8> {
        self.0.inner.lock().entries[&offset].data.clone()
    }
}

fn blocking_pwrite(backend: &Arc<dyn Backend>, offset: u64, data: Vec<u8>) -> i64 {
    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    backend.async_pwrite(offset, data, Box::new(move |ret| *result2.lock() = Some(ret)));
    (*result.lock()).expect("reference backends complete inline")
}

fn blocking_flush(backend: &Arc<dyn Backend>) -> i64 {
    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    backend.async_flush(Box::new(move |ret| *result2.lock() = Some(ret)));
    (*result.lock()).expect("reference backends complete inline")
}

/// A pinned reference to a cached table (§4.4 `get`). Un-pins on drop.
pub struct CacheRef {
    cache: TableCache,
    offset: u64,
}

impl CacheRef {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.cache.read_from(self.offset)
    }

    /// Overwrite `bytes.len()` bytes at `at` and mark the entry dirty.
    pub fn write(&self, at: usize, bytes: &[u8]) {
        self.cache.write_into(self.offset, at, bytes);
        self.cache.mark_dirty(self.offset);
    }
}

impl Drop for CacheRef {
    fn drop(&mut self) {
        self.cache.put(self.offset);
    }
}

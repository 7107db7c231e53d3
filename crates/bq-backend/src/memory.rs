//! An in-memory reference backend (§4.5.1): a growable byte buffer plus
//! deterministic fault injection and completion deferral, used to exercise
//! the queue's scenarios (§8) without a real block device.

use std::collections::VecDeque;

use bq_error::Result;
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{Backend, Completion};
use crate::flags::OpenFlags;

struct Inner {
    data: Vec<u8>,
    fill: u8,
    auto_complete: bool,
    deferred: VecDeque<(i64, Completion)>,
    fault_plan: VecDeque<i32>,
}

impl Inner {
    fn ensure_len(&mut self, end: usize) {
        if end > self.data.len() {
            self.data.resize(end, self.fill);
        }
    }
}

/// A backend over an in-memory buffer, prefilled with a fixed byte.
///
/// By default every `async_pwrite`/`async_flush` completes inline (as soon
/// as the call returns). Call `set_auto_complete(false)` (see
/// [`MemoryBackend::set_auto_complete`]) to instead queue completions for the
/// test to fire explicitly with
/// [`MemoryBackend::pump`] — this is what lets scenario 5 (§8) observe that
/// a barrier's completion strictly precedes a later `aio_flush` barrier's.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    open_flags: OpenFlags,
}

impl MemoryBackend {
    /// Create a backend of `size` bytes, each initialized to `fill`.
    #[must_use]
    pub fn new(size: usize, fill: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![fill; size],
                fill,
                auto_complete: true,
                deferred: VecDeque::new(),
                fault_plan: VecDeque::new(),
            }),
            open_flags: OpenFlags::empty(),
        }
    }

    /// Create a write-through backend: callers must bypass the queue (§6).
    #[must_use]
    pub fn new_writethrough(size: usize, fill: u8) -> Self {
        Self {
            open_flags: OpenFlags::WRITETHROUGH,
            ..Self::new(size, fill)
        }
    }

    /// Toggle whether completions fire inline or are queued for [`Self::pump`].
    pub fn set_auto_complete(&self, auto: bool) {
        self.inner.lock().auto_complete = auto;
    }

    /// Schedule the next dispatched write/flush to fail with `code`
    /// (consumed one-shot, FIFO across repeated calls).
    pub fn inject_fault(&self, code: i32) {
        self.inner.lock().fault_plan.push_back(code);
    }

    /// Fire every deferred completion in FIFO dispatch order, returning how
    /// many fired. No-op unless auto-complete is disabled.
    pub fn pump(&self) -> usize {
        let deferred = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.deferred)
        };
        let count = deferred.len();
        for (ret, completion) in deferred {
            completion(ret);
        }
        count
    }

    /// Read directly from the backing buffer, bypassing any queue — used by
    /// tests to check the round-trip property in §8 against "raw backend"
    /// state.
    #[must_use]
    pub fn raw_read(&self, offset: u64, size: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = offset as usize;
        let end = start + size;
        if end <= inner.data.len() {
            inner.data[start..end].to_vec()
        } else {
            let mut out = vec![inner.fill; size];
            let avail = inner.data.len().saturating_sub(start);
            if avail > 0 {
                out[..avail].copy_from_slice(&inner.data[start..start + avail]);
            }
            out
        }
    }

    fn next_fault(inner: &mut Inner) -> Option<i32> {
        inner.fault_plan.pop_front()
    }
}

impl Backend for MemoryBackend {
    fn sync_pread(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        trace!(offset, size, "memory backend sync_pread");
        Ok(self.raw_read(offset, size))
    }

    fn async_pwrite(&self, offset: u64, buf: Vec<u8>, completion: Completion) {
        let mut inner = self.inner.lock();
        let ret = if let Some(code) = Self::next_fault(&mut inner) {
            i64::from(code)
        } else {
            let start = offset as usize;
            inner.ensure_len(start + buf.len());
            inner.data[start..start + buf.len()].copy_from_slice(&buf);
            0
        };
        trace!(offset, len = buf.len(), ret, "memory backend async_pwrite");
        if inner.auto_complete {
            drop(inner);
            completion(ret);
        } else {
            inner.deferred.push_back((ret, completion));
        }
    }

    fn async_flush(&self, completion: Completion) {
        let mut inner = self.inner.lock();
        let ret = Self::next_fault(&mut inner).map_or(0, i64::from);
        trace!(ret, "memory backend async_flush");
        if inner.auto_complete {
            drop(inner);
            completion(ret);
        } else {
            inner.deferred.push_back((ret, completion));
        }
    }

    fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }
}

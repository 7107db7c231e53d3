//! The fundamental unit of the queue (§3): a tagged variant over
//! `{Write, Barrier}`, each carrying a `section`, its own waiter list, and
//! (for writes) an owned data buffer.

use std::sync::{Arc, Mutex};

/// Opaque handle identifying a request in [`crate::Queue`]'s storage.
///
/// Requests live in a `HashMap` keyed by this id rather than behind raw
/// pointers (§9 design notes: ownership-strict target, no back-pointers into
/// the queue beyond a handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

/// The byte payload and offset range of a queued write.
#[derive(Debug, Clone)]
pub struct WriteBody {
    pub offset: u64,
    pub buf: Vec<u8>,
}

impl WriteBody {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    /// Whether `[offset, offset + size)` intersects this write's range.
    #[must_use]
    pub fn intersects(&self, offset: u64, size: usize) -> bool {
        let end = offset + size as u64;
        offset < self.end() && self.offset < end
    }
}

/// The tagged variant (§3): a request is either queued data or an ordering
/// point.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Write(WriteBody),
    Barrier,
}

/// Shared state behind a [`FlushWaiter`]: `None` once fired or cancelled.
struct WaiterState {
    callback: Option<Box<dyn FnOnce(i32) + Send>>,
}

/// A completion callback attached to a Barrier request (§3, §4.6).
///
/// Cloning shares the same underlying slot: cancelling any clone prevents
/// the callback from firing, but does not remove the Barrier itself.
#[derive(Clone)]
pub struct FlushWaiter {
    state: Arc<Mutex<WaiterState>>,
}

impl FlushWaiter {
    pub(crate) fn new(callback: Box<dyn FnOnce(i32) + Send>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WaiterState {
                callback: Some(callback),
            })),
        }
    }

    /// Prevent the attached callback from firing. The Barrier it was
    /// attached to proceeds unaffected (§4.3 Cancellation).
    pub fn cancel(&self) {
        self.state.lock().unwrap().callback = None;
    }

    /// Fire the callback with `ret` if it has not already fired or been
    /// cancelled.
    pub(crate) fn fire(&self, ret: i32) {
        let cb = self.state.lock().unwrap().callback.take();
        if let Some(cb) = cb {
            cb(ret);
        }
    }
}

impl std::fmt::Debug for FlushWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushWaiter").finish_non_exhaustive()
    }
}

/// A queued Request: section, kind, and the waiters attached to it (§3).
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub section: u64,
    pub kind: RequestKind,
    pub waiters: Vec<FlushWaiter>,
}

impl Request {
    #[must_use]
    pub fn is_barrier(&self) -> bool {
        matches!(self.kind, RequestKind::Barrier)
    }

    #[must_use]
    pub fn as_write(&self) -> Option<&WriteBody> {
        match &self.kind {
            RequestKind::Write(w) => Some(w),
            RequestKind::Barrier => None,
        }
    }

    #[must_use]
    pub fn as_write_mut(&mut self) -> Option<&mut WriteBody> {
        match &mut self.kind {
            RequestKind::Write(w) => Some(w),
            RequestKind::Barrier => None,
        }
    }

    /// Fire every attached waiter with `ret` and clear the list.
    pub(crate) fn fire_waiters(&mut self, ret: i32) {
        for waiter in self.waiters.drain(..) {
            waiter.fire(ret);
        }
    }
}

//! Queue Core (§4.1), Completion Driver (§4.3) and Error/Flush State Machine
//! (§4.6), all owned by one [`Queue`]: the `pending`/`in_flight`/`sections`
//! lists, the submission loop, and error latching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bq_backend::{Backend, OpenFlags};
use bq_error::{QueueError, Result};
use tracing::{debug, error, info, trace, warn};

use crate::config::QueueConfig;
use crate::request::{FlushWaiter, Request, RequestId, RequestKind, WriteBody};
use crate::resolver::{self, MergeOutcome};

/// `fn(ret) -> bool`: `true` keeps the queue and retries, `false` fails
/// forward and latches the error (§6 Error handler callback).
pub type ErrorHandler = dyn Fn(i32) -> bool + Send + Sync;

/// One entry of [`Queue::pending_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub section: u64,
    pub kind: PendingKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Write { offset: u64, len: usize },
    Barrier,
}

struct Inner {
    next_id: u64,
    storage: HashMap<RequestId, Request>,
    pending: Vec<RequestId>,
    in_flight: Vec<RequestId>,
    sections: Vec<RequestId>,
    in_flight_num: usize,
    barriers_requested: u64,
    barriers_submitted: u64,
    flushing: i32,
    error_ret: Option<QueueError>,
    num_waiting_for_cb: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            next_id: 0,
            storage: HashMap::new(),
            pending: Vec::new(),
            in_flight: Vec::new(),
            sections: Vec::new(),
            in_flight_num: 0,
            barriers_requested: 0,
            barriers_submitted: 0,
            flushing: 0,
            error_ret: None,
            num_waiting_for_cb: 0,
        }
    }

    fn alloc_id(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }

    /// I4: insert before the first Barrier in `sections` whose section is
    /// `>= section`; otherwise append to the tail of `pending`.
    fn insert_by_section(&mut self, id: RequestId, section: u64) {
        let pos = self
            .sections
            .iter()
            .find(|&&bid| self.storage[&bid].section >= section)
            .and_then(|&bid| self.pending.iter().position(|&p| p == bid));
        match pos {
            Some(idx) => self.pending.insert(idx, id),
            None => self.pending.push(id),
        }
    }

    fn reverse_ids(ids: &[RequestId]) -> Vec<RequestId> {
        ids.iter().rev().copied().collect()
    }

    /// §4.1 `pop`: remove the head of `pending` (moving it to `in_flight`
    /// is the caller's job); if it is a Barrier, it must also be the head
    /// of `sections` (I1) and is removed from both. The request itself
    /// stays in `storage` — §3's Lifecycle destroys it only on completion.
    fn pop(&mut self) -> Option<RequestId> {
        if self.pending.is_empty() {
            return None;
        }
        let id = self.pending.remove(0);
        if self.storage[&id].is_barrier() {
            assert_eq!(
                self.sections.first().copied(),
                Some(id),
                "I1 violated: barrier popped out of sections order"
            );
            self.sections.remove(0);
        }
        Some(id)
    }

    fn reinsert_at_head(&mut self, req: Request) {
        let id = req.id;
        if req.is_barrier() {
            self.sections.insert(0, id);
        }
        self.pending.insert(0, id);
        self.storage.insert(id, req);
    }

    fn queue_size(&self) -> usize {
        self.pending.len()
    }
}

/// Per-backing-device write-back queue (§3 `Queue`).
///
/// Cheaply cloneable: every clone shares the same underlying state, which
/// is how a completion callback fired from inside the backend (possibly on
/// another thread, per [`bq_backend::backend::Completion`]'s `Send` bound)
/// can call back into [`Queue::on_complete`].
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Mutex<Inner>>,
    backend: Arc<dyn Backend>,
    error_handler: Arc<ErrorHandler>,
    config: QueueConfig,
}

impl Queue {
    /// `queue_create(backend, err_handler, err_opaque)` (§6). The Rust
    /// signature drops the `opaque` parameter: a `Fn` closure captures
    /// whatever state the caller needs.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, error_handler: Arc<ErrorHandler>) -> Self {
        Self::with_config(backend, error_handler, QueueConfig::default())
    }

    #[must_use]
    pub fn with_config(
        backend: Arc<dyn Backend>,
        error_handler: Arc<ErrorHandler>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            backend,
            error_handler,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Write-through bypass (§6): callers must skip the queue when the
    /// backend reports `WRITETHROUGH`.
    #[must_use]
    pub fn is_writethrough(&self) -> bool {
        self.backend.open_flags().contains(OpenFlags::WRITETHROUGH)
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// `is_empty(queue)` (§6).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pending.is_empty() && inner.in_flight.is_empty()
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.inner.lock().unwrap().queue_size()
    }

    #[must_use]
    pub fn in_flight_num(&self) -> usize {
        self.inner.lock().unwrap().in_flight_num
    }

    #[must_use]
    pub fn error_ret(&self) -> Option<QueueError> {
        self.inner.lock().unwrap().error_ret
    }

    /// A snapshot of `pending` in pop order, for tests and diagnostics: the
    /// queue otherwise exposes no way to observe request identity or order.
    #[must_use]
    pub fn pending_snapshot(&self) -> Vec<PendingEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .iter()
            .map(|id| {
                let req = &inner.storage[id];
                let kind = match req.as_write() {
                    Some(w) => PendingKind::Write {
                        offset: w.offset,
                        len: w.buf.len(),
                    },
                    None => PendingKind::Barrier,
                };
                PendingEntry {
                    section: req.section,
                    kind,
                }
            })
            .collect()
    }

    // ---- Queue Core: pwrite / pread / barrier / aio_flush (§4.1, §4.2) ----

    /// `pread(ctx, offset, out, size)` fallthrough used by [`crate::Context`].
    /// Returns the resolved bytes and the bumped section (I7).
    pub(crate) fn pread(&self, ctx_section: u64, offset: u64, size: usize) -> Result<(Vec<u8>, u64)> {
        if self.is_writethrough() {
            return self.backend.sync_pread(offset, size).map(|b| (b, ctx_section));
        }
        let mut out = vec![0_u8; size];
        let mut max_section = ctx_section;
        let gaps = {
            let inner = self.inner.lock().unwrap();
            let pending_rev = Inner::reverse_ids(&inner.pending);
            let in_flight_rev = Inner::reverse_ids(&inner.in_flight);
            let after_pending =
                resolver::resolve_read(&pending_rev, &inner.storage, 0, offset, offset, size, &mut out, &mut max_section);
            let mut remaining = Vec::new();
            for (g_off, g_len) in after_pending {
                remaining.extend(resolver::resolve_read(
                    &in_flight_rev,
                    &inner.storage,
                    0,
                    offset,
                    g_off,
                    g_len,
                    &mut out,
                    &mut max_section,
                ));
            }
            remaining
        };
        trace!(offset, size, gaps = gaps.len(), "pread resolved against queue");
        for (g_off, g_len) in gaps {
            let filled = self.backend.sync_pread(g_off, g_len)?;
            let start = (g_off - offset) as usize;
            out[start..start + g_len].copy_from_slice(&filled);
        }
        Ok((out, max_section))
    }

    /// `pwrite(ctx, offset, size, buf)` (§4.1). Returns the (possibly
    /// bumped, per §4.2) section the caller's context should adopt.
    pub(crate) fn pwrite(&self, ctx_section: u64, offset: u64, buf: Vec<u8>) -> Result<u64> {
        if self.is_writethrough() {
            self.backend_sync_write(offset, &buf)?;
            return Ok(ctx_section);
        }
        let size = buf.len();
        let mut inner = self.inner.lock().unwrap();
        let pending_rev = Inner::reverse_ids(&inner.pending);
        let outcome = resolver::resolve_write_merge(&pending_rev, &mut inner.storage, ctx_section, offset, size, &buf);
        match outcome {
            MergeOutcome::Merged => {
                debug!(offset, size, "pwrite absorbed into existing queued write");
                Ok(ctx_section)
            }
            MergeOutcome::NotMerged { section } => {
                let id = inner.alloc_id();
                inner.storage.insert(
                    id,
                    Request {
                        id,
                        section,
                        kind: RequestKind::Write(WriteBody { offset, buf }),
                        waiters: Vec::new(),
                    },
                );
                inner.insert_by_section(id, section);
                trace!(offset, size, section, "enqueued new write");
                Ok(section)
            }
        }
    }

    /// `barrier(ctx)` (§4.1): merge with the first Barrier whose section is
    /// `>= ctx.section`, or append a new one. Bypasses the queue entirely on
    /// a write-through backend (§6): the synchronous flush either succeeds,
    /// in which case every prior write is already durable, or fails, and the
    /// caller learns about it directly rather than via a later `flush()`.
    pub(crate) fn barrier(&self, ctx_section: u64) -> Result<u64> {
        if self.is_writethrough() {
            self.backend_sync_flush()?;
            return Ok(ctx_section);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(next_section) = Self::merge_barrier(&inner, ctx_section) {
            return Ok(next_section);
        }
        let id = Self::append_new_barrier(&mut inner, ctx_section, Vec::new());
        debug!(section = ctx_section, id = id.0, "appended new barrier");
        Ok(ctx_section + 1)
    }

    /// `aio_flush(ctx, cb, opaque)` (§4.1, §4.6): like `barrier`, but only
    /// merges with a Barrier that is the very last entry of `pending`. On a
    /// write-through backend (§6), bypasses the queue and hands `callback`
    /// straight to `backend.async_flush`.
    pub(crate) fn aio_flush(&self, ctx_section: u64, callback: Box<dyn FnOnce(i32) + Send>) -> (u64, FlushWaiter) {
        let waiter = FlushWaiter::new(callback);

        if self.is_writethrough() {
            let fired = waiter.clone();
            self.backend.async_flush(Box::new(move |ret| fired.fire(clamp_ret(ret))));
            debug!(section = ctx_section, "write-through aio_flush bypassed the queue");
            return (ctx_section, waiter);
        }

        let mut inner = self.inner.lock().unwrap();

        let candidate = inner
            .sections
            .iter()
            .copied()
            .find(|&bid| inner.storage[&bid].section >= ctx_section);
        if let Some(bid) = candidate {
            if inner.pending.last().copied() == Some(bid) {
                let section = inner.storage[&bid].section;
                inner.storage.get_mut(&bid).unwrap().waiters.push(waiter.clone());
                inner.num_waiting_for_cb += 1;
                return (section + 1, waiter);
            }
        }

        let id = Self::append_new_barrier(&mut inner, ctx_section, vec![waiter.clone()]);
        inner.num_waiting_for_cb += 1;
        debug!(section = ctx_section, id = id.0, "appended tail barrier for aio_flush");
        (ctx_section + 1, waiter)
    }

    fn merge_barrier(inner: &Inner, ctx_section: u64) -> Option<u64> {
        if let Some(bid) = inner
            .sections
            .iter()
            .copied()
            .find(|&bid| inner.storage[&bid].section >= ctx_section)
        {
            let section = inner.storage[&bid].section;
            trace!(section, "barrier merged with existing section boundary");
            return Some(section + 1);
        }

        // Idempotence (§8): a barrier immediately following another in the
        // same context, with nothing written in between, must not allocate
        // a second Barrier. The direct search above only matches a Barrier
        // whose section is still >= ctx_section; after the first barrier()
        // call ctx_section has already moved one past it, so without this
        // fallback every subsequent no-op barrier() would append a fresh,
        // empty section boundary.
        let tail_bid = *inner.sections.last()?;
        let tail_section = inner.storage[&tail_bid].section;
        if ctx_section > 0 && tail_section == ctx_section - 1 && !Self::has_write_in_section(inner, ctx_section) {
            trace!(section = tail_section, "barrier idempotent with trailing barrier");
            return Some(tail_section + 1);
        }
        None
    }

    fn has_write_in_section(inner: &Inner, section: u64) -> bool {
        inner.pending.iter().chain(inner.in_flight.iter()).any(|&id| {
            let req = &inner.storage[&id];
            !req.is_barrier() && req.section == section
        })
    }

    fn append_new_barrier(inner: &mut Inner, section: u64, waiters: Vec<FlushWaiter>) -> RequestId {
        let id = inner.alloc_id();
        inner.storage.insert(
            id,
            Request {
                id,
                section,
                kind: RequestKind::Barrier,
                waiters,
            },
        );
        inner.pending.push(id);
        inner.sections.push(id);
        inner.barriers_requested += 1;
        id
    }

    fn backend_sync_write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let result = Arc::new(Mutex::new(None));
        let result2 = Arc::clone(&result);
        self.backend
            .async_pwrite(offset, buf.to_vec(), Box::new(move |ret| *result2.lock().unwrap() = Some(ret)));
        let ret = result.lock().unwrap().ok_or(QueueError::InvariantViolation {
            detail: "writethrough backend did not complete synchronously",
        })?;
        if ret < 0 {
            return Err(QueueError::from_backend_code(ret as i32, self.config.no_space_code));
        }
        Ok(())
    }

    fn backend_sync_flush(&self) -> Result<()> {
        let result = Arc::new(Mutex::new(None));
        let result2 = Arc::clone(&result);
        self.backend
            .async_flush(Box::new(move |ret| *result2.lock().unwrap() = Some(ret)));
        let ret = result.lock().unwrap().ok_or(QueueError::InvariantViolation {
            detail: "writethrough backend did not complete synchronously",
        })?;
        if ret < 0 {
            return Err(QueueError::from_backend_code(ret as i32, self.config.no_space_code));
        }
        Ok(())
    }

    // ---- Completion Driver (§4.3) ----

    /// Peek `pending`'s head and dispatch it if submission rules allow.
    /// Returns whether a request was dispatched.
    pub fn submit_one(&self) -> bool {
        enum Dispatch {
            Write { id: RequestId, offset: u64, buf: Vec<u8> },
            Barrier { id: RequestId },
        }

        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.error_ret.is_some() || inner.in_flight_num > 0 {
                return false;
            }
            let Some(&head_id) = inner.pending.first() else {
                return false;
            };
            let head_is_barrier = inner.storage[&head_id].is_barrier();
            if head_is_barrier
                && inner.queue_size() < self.config.barrier_threshold
                && inner.flushing <= 0
                && inner.num_waiting_for_cb == 0
            {
                return false;
            }

            let popped_id = inner.pop().expect("head was peeked above");
            debug_assert_eq!(popped_id, head_id);
            inner.in_flight.push(head_id);
            inner.in_flight_num += 1;

            let req = inner.storage.get(&head_id).expect("dispatched id is in storage");
            match &req.kind {
                RequestKind::Write(w) => Dispatch::Write {
                    id: head_id,
                    offset: w.offset,
                    buf: w.buf.clone(),
                },
                RequestKind::Barrier => {
                    inner.barriers_submitted += 1;
                    Dispatch::Barrier { id: head_id }
                }
            }
        };

        let queue = self.clone();
        match dispatch {
            Dispatch::Write { id, offset, buf } => {
                trace!(id = id.0, offset, len = buf.len(), "submitting write");
                self.backend
                    .async_pwrite(offset, buf, Box::new(move |ret| queue.on_complete(id, ret)));
            }
            Dispatch::Barrier { id } => {
                debug!(id = id.0, "submitting barrier");
                self.backend.async_flush(Box::new(move |ret| queue.on_complete(id, ret)));
            }
        }
        true
    }

    /// `drive()` (§4.3): submit until `submit_one` refuses.
    pub fn drive(&self) {
        while self.submit_one() {}
    }

    /// `on_complete(request, ret)` (§4.3).
    fn on_complete(&self, id: RequestId, ret: i64) {
        let ret_code = clamp_ret(ret);
        let retry_decision = {
            let mut inner = self.inner.lock().unwrap();
            let pos = inner
                .in_flight
                .iter()
                .position(|&r| r == id)
                .expect("completing id is in in_flight");
            inner.in_flight.remove(pos);
            inner.in_flight_num -= 1;

            let mut req = inner.storage.remove(&id).expect("completing id is in storage");
            let is_barrier = req.is_barrier();

            if ret_code < 0 {
                let classified = QueueError::from_backend_code(ret_code, self.config.no_space_code);
                let should_latch = !inner.error_ret.is_some_and(QueueError::is_no_space);
                if should_latch {
                    inner.error_ret = Some(classified);
                }
                error!(id = id.0, ret = ret_code, is_barrier, "backend completion failed");
            } else {
                trace!(id = id.0, is_barrier, "backend completion succeeded");
            }

            inner.num_waiting_for_cb = inner.num_waiting_for_cb.saturating_sub(req.waiters.len());
            req.fire_waiters(ret_code);

            if ret_code < 0 {
                let keep_queue = (self.error_handler)(ret_code);
                if keep_queue {
                    warn!(id = id.0, "retrying failed request, error cleared");
                    inner.error_ret = None;
                    inner.reinsert_at_head(req);
                } else {
                    warn!(id = id.0, "request failed permanently, draining waiters");
                    let ret_for_waiters = inner
                        .error_ret
                        .map_or(ret_code, |e| e.as_raw(self.config.no_space_code));
                    let pending_ids = inner.pending.clone();
                    for pid in pending_ids {
                        let fired = if let Some(pending_req) = inner.storage.get_mut(&pid) {
                            let fired = pending_req.waiters.len();
                            pending_req.fire_waiters(ret_for_waiters);
                            fired
                        } else {
                            0
                        };
                        inner.num_waiting_for_cb = inner.num_waiting_for_cb.saturating_sub(fired);
                    }
                }
                Some(keep_queue)
            } else {
                None
            }
        };
        let _ = retry_decision;
        self.drive();
    }

    // ---- Error & Flush State Machine (§4.6) ----

    /// `flush(queue)` (§4.6): drains `pending` and `in_flight`. Assumes the
    /// backend either completes inline or has already been pumped by the
    /// caller (§5: single-threaded cooperative model, no real executor
    /// here to block on).
    pub fn flush(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.flushing = 1;
        }
        info!("flush: draining queue");
        self.drive();
        let (empty, err) = {
            let inner = self.inner.lock().unwrap();
            (inner.pending.is_empty() && inner.in_flight.is_empty(), inner.error_ret)
        };
        if empty {
            self.inner.lock().unwrap().flushing = 0;
            info!("flush: queue drained");
            return err.map_or(Ok(()), Err);
        }
        if let Some(e) = err {
            self.inner.lock().unwrap().flushing = 0;
            warn!(?e, "flush: stopped on latched error");
            return Err(e);
        }
        // No further progress is possible without more backend completions;
        // the caller must pump a deferred-completion backend before calling
        // flush() again.
        Ok(())
    }

    /// `destroy(queue)` (§3 Lifecycle, §4.6 Draining-to-Destroy): flushes
    /// and asserts both lists are empty.
    pub fn destroy(self) -> Result<()> {
        self.flush()?;
        let inner = self.inner.lock().unwrap();
        if !inner.pending.is_empty() || !inner.in_flight.is_empty() {
            return Err(QueueError::InvariantViolation {
                detail: "destroy called with a non-empty queue",
            });
        }
        Ok(())
    }
}

/// Clamp a backend completion code to `i32`, matching what every `QueueError`
/// constructor and the storage fields already expect.
fn clamp_ret(ret: i64) -> i32 {
    ret.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

//! The Backend Adapter contract (§4.5): the only seam between the queue and
//! a concrete backing device. Everything on the other side of this trait —
//! device probing, option parsing, vendor strings, transport decoding,
//! coroutine plumbing — is out of scope (§1) and never named here.

use crate::flags::OpenFlags;
use bq_error::Result;

/// A completion callback: invoked exactly once with the backend's result code.
///
/// `0` on success, a negative code on failure, mirroring `cb(opaque, ret)`
/// from §4.5. `'static + Send` because, in a real deployment, the backend may
/// hand it to another thread or a kernel completion queue before calling it
/// back on the event loop.
pub type Completion = Box<dyn FnOnce(i64) + Send>;

/// The four operations a backing device must provide.
///
/// Implementors own no queue state; they are pure I/O. The single-threaded
/// cooperative model (§5) means "asynchronous" here means "callback-driven",
/// not "executed on another OS thread" — a backend is free to invoke its
/// `Completion` inline before returning, or defer it to a later pump, as
/// long as it is invoked exactly once.
pub trait Backend: Send + Sync {
    /// Synchronous read at an arbitrary (sector-aligned) offset.
    fn sync_pread(&self, offset: u64, size: usize) -> Result<Vec<u8>>;

    /// Asynchronous write; `completion` fires with `0` or a negative code.
    fn async_pwrite(&self, offset: u64, buf: Vec<u8>, completion: Completion);

    /// Asynchronous cache flush; `completion` fires with `0` or a negative code.
    fn async_flush(&self, completion: Completion);

    /// Probe the backend's open flags, notably write-through (§6).
    fn open_flags(&self) -> OpenFlags;
}

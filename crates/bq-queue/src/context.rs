//! Producer Context (§3, §6): the per-producer view onto a [`Queue`],
//! tracking the caller's current `section`.

use bq_error::Result;

use crate::queue::Queue;
use crate::request::FlushWaiter;

/// `context_open(queue) → ctx` (§6): `ctx.section` starts at zero.
pub struct Context {
    queue: Queue,
    section: u64,
}

impl Context {
    #[must_use]
    pub fn open(queue: Queue) -> Self {
        Self { queue, section: 0 }
    }

    #[must_use]
    pub fn section(&self) -> u64 {
        self.section
    }

    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// `pwrite(ctx, offset, buf, size)` (§4.1).
    pub fn pwrite(&mut self, offset: u64, buf: Vec<u8>) -> Result<()> {
        self.section = self.queue.pwrite(self.section, offset, buf)?;
        Ok(())
    }

    /// `pread(ctx, offset, out, size)` (§4.2).
    pub fn pread(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let (data, section) = self.queue.pread(self.section, offset, size)?;
        self.section = section;
        Ok(data)
    }

    /// `barrier(ctx)` (§4.1, §6). On a write-through backend this bypasses
    /// the queue and issues a synchronous flush directly, so it can fail.
    pub fn barrier(&mut self) -> Result<()> {
        self.section = self.queue.barrier(self.section)?;
        Ok(())
    }

    /// `aio_flush(ctx, cb, opaque)` (§4.1, §4.6). Returns the attached
    /// [`FlushWaiter`], which the caller may cancel.
    pub fn aio_flush(&mut self, callback: impl FnOnce(i32) + Send + 'static) -> FlushWaiter {
        let (section, waiter) = self.queue.aio_flush(self.section, Box::new(callback));
        self.section = section;
        waiter
    }
}

//! Open-flags probe (§4.5): reveals whether a backend is in write-through
//! mode, which makes `pwrite`/`barrier`/`aio_flush` bypass the queue (§6).

use bitflags::bitflags;

bitflags! {
    /// Flags a backend reports through [`crate::Backend::open_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Backend completes writes/flushes synchronously and durably on
        /// return; callers must bypass the queue entirely (§6).
        const WRITETHROUGH = 1 << 0;
        /// Backend is read-only; `async_pwrite`/`async_flush` always fail.
        const READ_ONLY = 1 << 1;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::empty()
    }
}

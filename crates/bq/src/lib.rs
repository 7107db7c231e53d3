//! Public API facade: re-exports the Backend Adapter, Queue Core, and Table
//! Cache so a caller depends on one crate instead of the workspace's
//! internal split.

pub use bq_backend::{Backend, Completion, FileBackend, MemoryBackend, OpenFlags};
pub use bq_cache::{CacheRef, TableCache};
pub use bq_error::{QueueError, Result, ENOSPC};
pub use bq_queue::{
    Context, ErrorHandler, FlushWaiter, PendingEntry, PendingKind, Queue, QueueConfig, RequestId,
};

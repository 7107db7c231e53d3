//! The write-back block queue core (§2): Queue Core, Read/Write Overlap
//! Resolver, Completion Driver, and Error/Flush State Machine. Everything
//! else named in the specification — device probing, on-disk formats,
//! transports, administrative surfaces — is out of scope (§1) and is never
//! imported here.

mod config;
mod context;
mod queue;
mod request;
mod resolver;

pub use config::QueueConfig;
pub use context::Context;
pub use queue::{ErrorHandler, PendingEntry, PendingKind, Queue};
pub use request::{FlushWaiter, RequestId};

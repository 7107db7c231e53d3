//! The Backend Adapter contract (§4.5) and the reference backends used to
//! exercise and benchmark the queue. The backing block driver itself —
//! device probing, transports, administrative surfaces — is out of scope
//! (§1); this crate carries only the seam and two minimal implementations.

mod backend;
mod file;
mod flags;
mod memory;

pub use backend::{Backend, Completion};
pub use file::FileBackend;
pub use flags::OpenFlags;
pub use memory::MemoryBackend;

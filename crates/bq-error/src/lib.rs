//! Error taxonomy shared by every crate in the workspace.
//!
//! Mirrors the host project's one-error-crate-per-workspace convention: a
//! single `thiserror`-derived enum, a `Result` alias, and constructors for
//! the handful of error shapes the queue core actually produces.

use thiserror::Error;

/// The platform's conventional "no space left on device" code (`ENOSPC`).
pub const ENOSPC: i32 = 28;

/// Errors surfaced by the queue, the backend adapter, and the table cache.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A raw backend completion/errno-style code from a Write or Flush.
    #[error("backend I/O error (code {code})")]
    Backend {
        /// The raw code reported by the backend adapter.
        code: i32,
    },

    /// The distinguished "no-space" backend error, latched preferentially
    /// over other errors so the first reported error is meaningful (§7).
    #[error("backend reported no space left on device")]
    NoSpace,

    /// One of I1-I7 (or the destroy-not-empty check) was violated. These are
    /// bugs, not runtime conditions: callers should treat this as fatal.
    #[error("queue invariant violated: {detail}")]
    InvariantViolation {
        /// Which invariant was violated, for diagnostics.
        detail: &'static str,
    },

    /// A `FlushWaiter` was cancelled before its barrier completed.
    #[error("flush waiter cancelled before completion")]
    Cancelled,

    /// The table cache (§4.4) has no unpinned entry left to evict.
    #[error("table cache is full and every entry is pinned")]
    CacheFull,
}

impl QueueError {
    /// Classify a raw backend completion code, preferring [`QueueError::NoSpace`]
    /// when `code` matches `no_space_code`.
    #[must_use]
    pub const fn from_backend_code(code: i32, no_space_code: i32) -> Self {
        if code == no_space_code {
            Self::NoSpace
        } else {
            Self::Backend { code }
        }
    }

    /// The raw backend code this error corresponds to, for latch comparisons
    /// and FFI-shaped boundaries that still want an `i32`.
    #[must_use]
    pub const fn as_raw(self, no_space_code: i32) -> i32 {
        match self {
            Self::Backend { code } => code,
            Self::NoSpace => no_space_code,
            Self::InvariantViolation { .. } | Self::Cancelled | Self::CacheFull => -1,
        }
    }

    /// Whether this error is the distinguished no-space condition.
    #[must_use]
    pub const fn is_no_space(self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, QueueError>;

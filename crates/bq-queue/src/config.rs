//! Constructor-time configuration (§3.1): the barrier-submission threshold
//! and the backend's no-space error code, rather than hardcoded constants.

use bq_error::ENOSPC;

/// Tunables for a [`crate::Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// `queue_size` floor below which a non-flushing, non-waited-on Barrier
    /// head defers submission (§4.3). Default 50.
    pub barrier_threshold: usize,
    /// The backend error code treated as "no-space" and latched
    /// preferentially over other errors (§7). Default `ENOSPC`.
    pub no_space_code: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            barrier_threshold: 50,
            no_space_code: ENOSPC,
        }
    }
}

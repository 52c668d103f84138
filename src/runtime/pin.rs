//! Loop liveness pinning.
//!
//! A pin is an external reason to keep the loop alive that is not itself a
//! queued Activity — a listening socket, an open IPC channel. The loop's
//! termination predicate consults this counter; whoever drops the count to
//! zero must wake the selector so termination is re-evaluated promptly.

use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// Wait-free counter of reasons to keep the loop alive.
#[derive(Debug, Default)]
pub struct PinCounter {
    count: AtomicI64,
}

impl PinCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one reason to stay alive. Returns the new count.
    pub fn pin(&self) -> i64 {
        let current = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(pin_count = current, "pin");
        current
    }

    /// Removes one reason to stay alive. Returns the new count.
    ///
    /// Going negative is a collaborator bug; it is logged, not fatal.
    pub fn unpin(&self) -> i64 {
        let current = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(pin_count = current, "unpin");
        if current < 0 {
            warn!(pin_count = current, "negative pin count");
        }
        current
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// True while at least one pin is held.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.count() > 0
    }
}

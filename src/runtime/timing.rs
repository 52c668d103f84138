//! Per-Activity script timing window.
//!
//! When the environment configures a script time limit, each script invocation
//! publishes its watchdog deadline into a thread-local slot before running.
//! An out-of-band watchdog may read the slot and inject an interruption; the
//! injected raise then flows through the normal exception boundary.
//!
//! The slot is cleared on every exit path: the guard clears on drop, and the
//! exception boundary clears eagerly before the fatal handler runs so the
//! handler itself is never timed.

use std::cell::Cell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

thread_local! {
    static SCRIPT_DEADLINE_MS: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Current epoch time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Reads the current thread's script watchdog deadline, if a window is open.
#[must_use]
pub fn current_deadline_ms() -> Option<u64> {
    SCRIPT_DEADLINE_MS.with(Cell::get)
}

/// Clears the current thread's window. Idempotent.
pub(crate) fn clear_current() {
    SCRIPT_DEADLINE_MS.with(|slot| slot.set(None));
}

/// Timing policy for one runtime: a limit, or unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingWindow {
    limit_ms: Option<u64>,
}

impl TimingWindow {
    /// Creates a window policy from an optional limit.
    #[must_use]
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            limit_ms: limit.map(|d| d.as_millis() as u64),
        }
    }

    /// Opens a window for one script invocation. With no limit configured the
    /// returned guard is disarmed and does nothing.
    #[must_use]
    pub fn start(&self) -> TimingGuard {
        match self.limit_ms {
            Some(limit) => {
                SCRIPT_DEADLINE_MS.with(|slot| slot.set(Some(now_millis() + limit)));
                TimingGuard { armed: true }
            }
            None => TimingGuard { armed: false },
        }
    }
}

/// RAII handle closing the timing window on all exit paths.
#[derive(Debug)]
pub struct TimingGuard {
    armed: bool,
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.armed {
            clear_current();
        }
    }
}

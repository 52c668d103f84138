//! One-shot readiness latch.
//!
//! Parent runtimes must not message a child script before its globals exist.
//! The runtime releases this latch once after initialization (success or
//! failure); producers block on it before their first send.

use std::sync::{Condvar, Mutex};

/// A latch that opens once and stays open.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    /// Creates a closed latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the latch, releasing all current and future waiters.
    pub fn open(&self) {
        let mut open = self.open.lock().expect("latch mutex poisoned");
        *open = true;
        self.condvar.notify_all();
    }

    /// Blocks until the latch opens. Returns immediately once open.
    pub fn wait(&self) {
        let mut open = self.open.lock().expect("latch mutex poisoned");
        while !*open {
            open = self.condvar.wait(open).expect("latch mutex poisoned");
        }
    }

    /// True once the latch has opened.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.open.lock().expect("latch mutex poisoned")
    }
}

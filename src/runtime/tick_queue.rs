//! Multi-producer, single-consumer queue of ready-to-run Activities.
//!
//! Producers on any thread push; only the loop thread pops. Observable order
//! is enqueue order and the queue is never re-sorted. There is no capacity
//! bound; backpressure is the caller's problem.
//!
//! Pushing alone does not wake a blocked loop — every producer-side enqueue
//! must be followed by a selector wakeup, which the runtime handle does.

use crate::runtime::activity::Activity;
use crossbeam_queue::SegQueue;

/// Lock-free MPSC FIFO of [`Activity`] values.
#[derive(Debug, Default)]
pub struct TickQueue {
    queue: SegQueue<Activity>,
}

impl TickQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an Activity. Callable from any thread.
    pub fn push(&self, activity: Activity) {
        self.queue.push(activity);
    }

    /// Pops the oldest Activity, if any. Loop thread only.
    #[must_use]
    pub fn pop(&self) -> Option<Activity> {
        self.queue.pop()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued Activities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

//! The universal unit of deferred work.
//!
//! Every deferred thing the loop runs — a queued callback, a host task, a
//! timer — is an [`Activity`]: a common scheduling header plus a payload
//! variant. Dispatch is an exhaustive match over the variant, and the header
//! carries everything the queues need (sequence id, absolute deadline, repeat
//! interval, cancellation latch, domain binding).
//!
//! Cancellation is a monotonic latch shared with [`ActivityHandle`]: once set
//! it is never cleared, the payload is skipped wherever the Activity surfaces,
//! and repetition is suppressed.

use crate::error::ScriptError;
use crate::process::{CallbackInvocation, DomainRef};
use crate::runtime::state::RuntimeState;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A host task given the runtime state (and through it, the script scope).
pub type ScriptTask = Box<dyn FnMut(&mut RuntimeState) -> Result<(), ScriptError> + Send>;

/// A pure host task that never touches the script scope.
pub type HostTask = Box<dyn FnMut() + Send>;

/// The executable payload of an [`Activity`].
pub enum Payload {
    /// A script function call, routed through the process tick submitter so
    /// the interpreter's error path and domain stack are exercised.
    Callback(CallbackInvocation),
    /// A host task executed with the runtime state.
    Task(ScriptTask),
    /// A scope-free host task.
    Runnable(HostTask),
    /// A timer built off-thread, carried through the tick queue so the loop
    /// thread assigns its sequence id and inserts it into the heap.
    TimerInstall(Option<Box<Activity>>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Task(_) => f.write_str("Task"),
            Self::Runnable(_) => f.write_str("Runnable"),
            Self::TimerInstall(_) => f.write_str("TimerInstall"),
        }
    }
}

/// A cancellable, optionally repeating, deadline-bearing unit of work.
pub struct Activity {
    /// Insertion sequence; FIFO tiebreak for equal deadlines.
    pub(crate) seq: u64,
    /// Absolute deadline in epoch milliseconds; zero for immediate ticks.
    pub(crate) deadline_ms: u64,
    /// Repeat interval in milliseconds; zero when non-repeating.
    pub(crate) interval_ms: u64,
    /// Whether the Activity re-arms after execution.
    pub(crate) repeating: bool,
    /// Shared cancellation latch.
    pub(crate) cancelled: Arc<AtomicBool>,
    /// Domain entered around execution, if bound.
    pub(crate) domain: Option<DomainRef>,
    /// What to run.
    pub(crate) payload: Payload,
}

impl Activity {
    fn new(payload: Payload, domain: Option<DomainRef>) -> Self {
        Self {
            seq: 0,
            deadline_ms: 0,
            interval_ms: 0,
            repeating: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            domain,
            payload,
        }
    }

    /// An immediate tick invoking a script callback.
    #[must_use]
    pub fn callback(call: CallbackInvocation, domain: Option<DomainRef>) -> Self {
        Self::new(Payload::Callback(call), domain)
    }

    /// An immediate tick running a host task with the script scope.
    #[must_use]
    pub fn task(task: ScriptTask, domain: Option<DomainRef>) -> Self {
        Self::new(Payload::Task(task), domain)
    }

    /// An immediate tick running a scope-free host task.
    #[must_use]
    pub fn runnable(task: HostTask, domain: Option<DomainRef>) -> Self {
        Self::new(Payload::Runnable(task), domain)
    }

    /// Wraps a timer Activity for loop-thread installation.
    #[must_use]
    pub(crate) fn timer_install(timer: Activity) -> Self {
        Self::new(Payload::TimerInstall(Some(Box::new(timer))), None)
    }

    /// Arms the scheduling header for timer use.
    pub(crate) fn arm(&mut self, deadline_ms: u64, repeating: bool, interval_ms: u64) {
        self.deadline_ms = deadline_ms;
        self.repeating = repeating;
        self.interval_ms = if repeating { interval_ms } else { 0 };
    }

    /// Computes the next deadline after a repeating fire. Re-armed from `now`
    /// at fire time, so repeated misses collapse into one.
    pub(crate) fn rearm(&mut self, now_ms: u64) {
        self.deadline_ms = now_ms + self.interval_ms;
    }

    /// Returns a cancellation token sharing this Activity's latch.
    #[must_use]
    pub fn handle(&self) -> ActivityHandle {
        ActivityHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// True once cancelled. Never reset.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The absolute deadline in epoch milliseconds.
    #[must_use]
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// True when the Activity re-arms after firing.
    #[must_use]
    pub fn is_repeating(&self) -> bool {
        self.repeating
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("seq", &self.seq)
            .field("deadline_ms", &self.deadline_ms)
            .field("interval_ms", &self.interval_ms)
            .field("repeating", &self.repeating)
            .field("cancelled", &self.is_cancelled())
            .field("domain", &self.domain.is_some())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Control token for a scheduled [`Activity`].
///
/// Holds only the cancellation latch: no completion surface, no result. Safe
/// to use from any thread.
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    cancelled: Arc<AtomicBool>,
}

impl ActivityHandle {
    /// Latches cancellation. The payload will not run and repetition stops;
    /// an Activity already sitting in a queue or heap is skipped lazily.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn cancellation_is_shared_and_latching() {
        init_test("cancellation_is_shared_and_latching");
        let activity = Activity::runnable(Box::new(|| {}), None);
        let handle = activity.handle();
        crate::assert_with_log!(
            !activity.is_cancelled(),
            "fresh activity is live",
            false,
            activity.is_cancelled()
        );
        handle.cancel();
        crate::assert_with_log!(
            activity.is_cancelled(),
            "cancellation reaches the activity",
            true,
            activity.is_cancelled()
        );
        assert!(handle.is_cancelled());
        // Latch, not a toggle.
        handle.cancel();
        assert!(activity.is_cancelled());
        crate::test_complete!("cancellation_is_shared_and_latching");
    }

    #[test]
    fn rearm_computes_from_fire_time() {
        init_test("rearm_computes_from_fire_time");
        let mut activity = Activity::runnable(Box::new(|| {}), None);
        activity.arm(1_000, true, 50);
        assert_eq!(activity.deadline_ms(), 1_000);
        assert!(activity.is_repeating());
        // Fired late at 1_130: next deadline counts from now, not from 1_000.
        activity.rearm(1_130);
        crate::assert_with_log!(
            activity.deadline_ms() == 1_180,
            "next deadline counts from fire time",
            1_180u64,
            activity.deadline_ms()
        );
        crate::test_complete!("rearm_computes_from_fire_time");
    }

    #[test]
    fn non_repeating_arm_zeroes_interval() {
        init_test("non_repeating_arm_zeroes_interval");
        let mut activity = Activity::runnable(Box::new(|| {}), None);
        activity.arm(500, false, 999);
        crate::assert_with_log!(
            !activity.is_repeating(),
            "one-shot arm is not repeating",
            false,
            activity.is_repeating()
        );
        assert_eq!(activity.interval_ms, 0);
        crate::test_complete!("non_repeating_arm_zeroes_interval");
    }
}

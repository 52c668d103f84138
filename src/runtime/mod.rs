//! The event loop and scheduling machinery.
//!
//! - [`activity`]: the unit of deferred work and its cancellation handle
//! - [`tick_queue`]: MPSC queue of ready Activities
//! - [`timer_heap`]: deadline-ordered min-heap with FIFO tiebreak
//! - [`pin`]: loop liveness counter
//! - [`latch`]: one-shot initialization latch
//! - [`selector`]: I/O readiness integration and wakeup
//! - [`pools`]: bounded (caller-runs) and unbounded worker pools
//! - [`timing`]: per-invocation script watchdog window
//! - [`flags`]: argv splitting and VM-flag interpretation
//! - [`config`]: runtime configuration
//! - [`state`]: the loop thread's exclusive state
//! - [`driver`]: the loop driver and the cross-thread producer handle

pub mod activity;
pub mod config;
pub mod driver;
pub mod flags;
pub mod latch;
pub mod pin;
pub mod pools;
pub mod selector;
pub mod state;
pub mod tick_queue;
pub mod timer_heap;
pub mod timing;

pub use activity::{Activity, ActivityHandle, HostTask, Payload, ScriptTask};
pub use config::RuntimeConfig;
pub use driver::{RuntimeHandle, ScriptRuntime, ScriptSource};
pub use flags::{FlagError, ParsedArgv, EXECUTABLE_NAME};
pub use latch::Latch;
pub use pin::PinCounter;
pub use pools::{AsyncPool, AsyncPoolHandle, UnboundedPool, UnboundedPoolHandle};
pub use selector::{
    Event, Events, Interest, LabSelector, PollSelector, Selector, SelectorHandler, Source, Token,
};
pub use state::{CloseableId, RuntimeState};
pub use tick_queue::TickQueue;
pub use timer_heap::TimerHeap;
pub use timing::{current_deadline_ms, TimingWindow};

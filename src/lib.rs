//! Noderun: an embeddable event loop and scheduling runtime for Node-style
//! scripts.
//!
//! # Overview
//!
//! Noderun marries a JavaScript interpreter (reached only through traits — it
//! is never linked here) to a host I/O reactor. One single-threaded
//! cooperative loop per script drives four classes of deferred work in a
//! strict phase order: next-tick microtasks, generic ticks, immediates, I/O
//! readiness, then timers. Producers on any thread submit work through a
//! lock-free queue and wake the selector; the loop stays alive while work is
//! queued, a pin is held, or the process object reports pending tasks.
//!
//! # Core Guarantees
//!
//! - **Phase ordering**: next-ticks before ticks before immediates before
//!   I/O before timers, every iteration
//! - **Timer ordering**: deadlines ascending, FIFO among equal deadlines
//! - **Race-free submission**: cross-thread enqueue is lock-free and always
//!   paired with a selector wakeup
//! - **Cancellation is a latch**: a cancelled Activity never runs and never
//!   repeats
//! - **Bounded blocking**: blocking work lands in a bounded caller-runs pool
//!   or an unbounded cached pool, never on the loop
//!
//! # Module Structure
//!
//! - [`runtime`]: the loop driver, queues, timers, selector, pools
//! - [`process`]: contracts consumed from the interpreter side
//! - [`value`]: interpreter-neutral script values
//! - [`ipc`]: structural message copy between runtimes
//! - [`path`]: virtual/physical path translation
//! - [`sandbox`]: embedder-supplied restrictions
//! - [`error`] / [`status`]: error taxonomy and terminal status
//! - [`test_utils`]: scripted collaborator doubles for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod error;
pub mod ipc;
pub mod path;
pub mod process;
pub mod runtime;
pub mod sandbox;
pub mod status;
pub mod test_utils;
pub mod value;

pub use error::{JsError, RuntimeError, RuntimeErrorKind, ScriptError};
pub use ipc::IpcMessage;
pub use path::PathTranslator;
pub use process::{CallbackInvocation, Closeable, Domain, DomainRef, ModuleRegistry, Process};
pub use runtime::{
    Activity, ActivityHandle, RuntimeConfig, RuntimeHandle, RuntimeState, ScriptRuntime,
    ScriptSource, ScriptTask,
};
pub use sandbox::{NetworkPolicy, Sandbox};
pub use status::ScriptStatus;
pub use value::{FunctionRef, ScriptValue};

//! Contracts consumed from external collaborators.
//!
//! The loop core never talks to a JavaScript engine directly. Everything that
//! executes script code goes through the [`Process`] trait, which the embedder
//! implements on top of its interpreter bridge. The traits here are the whole
//! seam: swap the implementation and the scheduler is none the wiser.
//!
//! Domains follow the capability shape from the domain module's contract:
//! `enter` / `exit` callables plus a disposed flag, resolved once at attach
//! time instead of per-call property lookups.

use crate::error::{JsError, ScriptError};
use crate::value::{FunctionRef, ScriptValue};
use std::io;
use std::sync::Arc;

/// A script function call captured for deferred execution.
///
/// The process object's tick submitter invokes it inside the interpreter's
/// tick/domain machinery, so the engine's error path is exercised the same way
/// it would be for a script-scheduled callback.
#[derive(Debug, Clone)]
pub struct CallbackInvocation {
    /// The function to call.
    pub function: FunctionRef,
    /// The receiver (`this`).
    pub this: ScriptValue,
    /// Positional arguments.
    pub args: Vec<ScriptValue>,
}

/// A script-level error-handling scope.
///
/// Entered before and exited after a task that was bound to it. The disposed
/// flag is re-checked immediately before execution; a disposed domain is
/// dropped for that run only.
pub trait Domain: Send + Sync {
    /// Invokes the domain's `enter` callable.
    fn enter(&self) -> Result<(), ScriptError>;
    /// Invokes the domain's `exit` callable.
    fn exit(&self) -> Result<(), ScriptError>;
    /// True once the domain has been disposed on the script side.
    fn is_disposed(&self) -> bool;
}

/// Shared handle to a [`Domain`]. Activities may cross threads, so the
/// reference is `Arc`, never `Rc`.
pub type DomainRef = Arc<dyn Domain>;

/// The process object: the loop's window into the interpreter.
///
/// All methods run on the loop thread. Methods that execute script code return
/// `Result` so raises (including the deliberate exit sentinel) propagate.
pub trait Process: Send {
    /// True while `process.nextTick` work is queued.
    fn is_tick_task_pending(&self) -> bool;

    /// True while `setImmediate` work is queued.
    fn is_immediate_task_pending(&self) -> bool;

    /// Drains the next-tick microtask queue completely, including anything
    /// the drained callbacks enqueue.
    fn process_tick_tasks(&mut self) -> Result<(), ScriptError>;

    /// Drains the immediate queue completely.
    fn process_immediate_tasks(&mut self) -> Result<(), ScriptError>;

    /// Runs a captured callback inside the interpreter's tick machinery,
    /// applying the given domain there.
    fn submit_tick(
        &mut self,
        call: CallbackInvocation,
        domain: Option<DomainRef>,
    ) -> Result<(), ScriptError>;

    /// The currently active domain, if any.
    fn domain(&self) -> Option<DomainRef>;

    /// Offers an uncaught exception to the script's fatal handler.
    ///
    /// `Ok(true)` consumes the exception and the loop continues. `Ok(false)`
    /// (including "no handler installed") makes it terminal. The handler may
    /// itself raise, notably `process.exit`.
    fn handle_fatal(&mut self, error: &JsError) -> Result<bool, ScriptError>;

    /// Emits a process-level event with one payload argument.
    fn emit_event(&mut self, event: &str, payload: ScriptValue) -> Result<(), ScriptError>;

    /// True once the process has started (or finished) emitting `exit`.
    fn is_exiting(&self) -> bool;

    /// Latches the exiting state before the `exit` event fires.
    fn set_exiting(&mut self, exiting: bool);

    /// Records whether an IPC parent is attached.
    fn set_connected(&mut self, connected: bool);

    /// Sets `process.argv`.
    fn set_argv(&mut self, argv: Vec<String>);

    /// Sets `process.execArgv` (VM flags consumed before the script name).
    fn set_exec_argv(&mut self, argv: Vec<String>);

    /// Marks the run as an inline-source eval (`-e` style), optionally
    /// printing the completion value.
    fn set_eval(&mut self, source: String, print_result: bool);

    /// Forces the bootstrap into the REPL even when stdin is not a TTY.
    fn set_force_repl(&mut self, force: bool);

    /// Sets the `throwDeprecation` process flag.
    fn set_throw_deprecation(&mut self, on: bool);

    /// Sets the `traceDeprecation` process flag.
    fn set_trace_deprecation(&mut self, on: bool);

    /// Installs a global `gc()` bound to the engine's collector hook
    /// (`--expose-gc`).
    fn install_gc_global(&mut self);
}

/// Factory side of the module system.
///
/// Resolution policy and loaders live with the embedder; the runtime only
/// caches what the factories return.
pub trait ModuleRegistry: Send {
    /// The bootstrap script. Called once with the process object already in
    /// scope; everything else (argv interpretation, user-script loading)
    /// happens inside it.
    fn main_script(&self) -> crate::runtime::activity::ScriptTask;

    /// Instantiates a public module's exports, or `None` when unknown.
    fn init_module(
        &self,
        name: &str,
        state: &mut crate::runtime::state::RuntimeState,
    ) -> Option<Result<ScriptValue, ScriptError>>;

    /// Instantiates an internal (`process.binding`-style) module's exports.
    fn init_internal_module(
        &self,
        name: &str,
        state: &mut crate::runtime::state::RuntimeState,
    ) -> Option<Result<ScriptValue, ScriptError>>;
}

/// A resource that must be released when the script ends.
///
/// Modules register sockets, descriptors, and pollers here; anything still
/// registered at shutdown is closed with the error logged and swallowed.
pub trait Closeable: Send {
    /// Releases the resource.
    fn close(&mut self) -> io::Result<()>;

    /// Short description used in leak logs.
    fn describe(&self) -> &str {
        "handle"
    }
}

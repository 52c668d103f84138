//! The loop driver.
//!
//! One [`ScriptRuntime`] per script. `run()` executes on a dedicated thread
//! that owns every piece of single-threaded state; other threads interact
//! only through [`RuntimeHandle`], whose operations funnel into the tick
//! queue and wake the selector.
//!
//! # Phase order
//!
//! Each loop iteration, separated phase-from-phase by the script-exception
//! boundary:
//!
//! 1. cancellation check
//! 2. next-tick microtasks (process object drains fully)
//! 3. generic ticks (drain the tick queue; a consumed fatal stops the drain
//!    for this iteration so errors cannot starve timers and I/O)
//! 4. immediates (process object drains fully)
//! 5. poll-timeout computation
//! 6. select (the loop's only blocking call)
//! 7. I/O dispatch, one handler invocation per selected key
//! 8. timer dispatch in `(deadline, sequence)` order
//!
//! Next-ticks precede everything per `process.nextTick` semantics, immediates
//! run before I/O per `setImmediate` placement, and timers fire last so an
//! I/O completion scheduled for the same tick is observable before the next
//! timer round.

use crate::error::{RuntimeError, RuntimeErrorKind, ScriptError};
use crate::ipc::IpcMessage;
use crate::path::PathTranslator;
use crate::process::{CallbackInvocation, DomainRef, ModuleRegistry, Process};
use crate::runtime::activity::{Activity, ActivityHandle, HostTask, Payload, ScriptTask};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::flags::{self, FlagError, EXECUTABLE_NAME};
use crate::runtime::latch::Latch;
use crate::runtime::pin::PinCounter;
use crate::runtime::pools::{AsyncPool, UnboundedPool};
use crate::runtime::selector::{Events, PollSelector, Selector};
use crate::runtime::state::{RuntimeState, StdioOverrides};
use crate::runtime::tick_queue::TickQueue;
use crate::runtime::timing::{self, TimingWindow};
use crate::sandbox::Sandbox;
use crate::status::ScriptStatus;
use crate::value::ScriptValue;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Poll bound used when no timer is armed: large, but finite, so a missed
/// producer wakeup degrades to a periodic re-check instead of a hang.
pub(crate) const DEFAULT_DELAY_MS: u64 = i32::MAX as u64;

/// What the script to run is.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// A script file on the physical filesystem.
    File {
        /// Physical path; scripts see its reverse translation.
        path: PathBuf,
    },
    /// Inline source, `-e`-style.
    Inline {
        /// Name reported as the script file.
        name: String,
        /// The source text.
        source: String,
        /// Print the completion value, `-p`-style.
        print_result: bool,
    },
    /// No script: hand control to the REPL.
    Repl {
        /// Enter the REPL even when stdin is not a TTY.
        force: bool,
    },
}

/// Cross-thread state shared between the loop and its producers.
pub(crate) struct Shared {
    pub(crate) ticks: TickQueue,
    pub(crate) pins: PinCounter,
    pub(crate) selector: Arc<dyn Selector>,
    cancelled: AtomicBool,
    pub(crate) initialized: Latch,
}

impl Shared {
    fn new(selector: Arc<dyn Selector>) -> Self {
        Self {
            ticks: TickQueue::new(),
            pins: PinCounter::new(),
            selector,
            cancelled: AtomicBool::new(false),
            initialized: Latch::new(),
        }
    }

    /// Enqueue plus the mandatory producer-side wakeup.
    pub(crate) fn enqueue(&self, activity: Activity) {
        self.ticks.push(activity);
        self.selector.wakeup();
    }

    pub(crate) fn unpin(&self) {
        if self.pins.unpin() == 0 {
            // Termination must be re-evaluated promptly.
            self.selector.wakeup();
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.selector.wakeup();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Thread-safe producer API for one script runtime.
///
/// Everything here is callable from any thread; submissions are marshalled
/// through the tick queue and followed by a selector wakeup.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl RuntimeHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Enqueues a script callback for the next tick phase.
    pub fn enqueue_callback(&self, call: CallbackInvocation, domain: Option<DomainRef>) {
        self.shared.enqueue(Activity::callback(call, domain));
    }

    /// Enqueues a host task given the script scope.
    pub fn enqueue_task(&self, task: ScriptTask) {
        self.enqueue_task_in_domain(task, None);
    }

    /// Enqueues a host task bound to a domain.
    pub fn enqueue_task_in_domain(&self, task: ScriptTask, domain: Option<DomainRef>) {
        self.shared.enqueue(Activity::task(task, domain));
    }

    /// Enqueues a scope-free host task.
    pub fn execute_script_task(&self, task: HostTask, domain: Option<DomainRef>) {
        self.shared.enqueue(Activity::runnable(task, domain));
    }

    /// Schedules a timer from any thread.
    ///
    /// The deadline is fixed now; the heap insertion happens on the loop
    /// thread, which also assigns the sequence id. Cancelling the returned
    /// handle before installation wins: the timer is never inserted.
    pub fn create_timed_task(
        &self,
        task: HostTask,
        delay: Duration,
        repeating: bool,
        domain: Option<DomainRef>,
    ) -> ActivityHandle {
        let delay_ms = delay.as_millis() as u64;
        let mut timer = Activity::runnable(task, domain);
        timer.arm(timing::now_millis() + delay_ms, repeating, delay_ms);
        let handle = timer.handle();
        self.shared.enqueue(Activity::timer_install(timer));
        handle
    }

    /// Delivers an IPC message: copied here, under the sender, then posted
    /// as a task into this runtime's tick queue.
    ///
    /// # Errors
    ///
    /// Fails for payload types the channel does not carry.
    pub fn deliver_ipc(&self, message: &IpcMessage) -> Result<(), RuntimeError> {
        let (event, payload) = crate::ipc::prepare(message)?;
        self.enqueue_task(Box::new(move |state| {
            state.process.emit_event(event, payload.clone())
        }));
        Ok(())
    }

    /// Marks one external reason to keep the loop alive.
    pub fn pin(&self) {
        self.shared.pins.pin();
    }

    /// Releases one liveness reason.
    pub fn unpin(&self) {
        self.shared.unpin();
    }

    /// Cancels the submission; the loop returns the cancellation status at
    /// its next iteration head.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Wakes the selector. Producers that bypass the enqueue helpers must
    /// call this themselves after pushing work.
    pub fn notify(&self) {
        self.shared.selector.wakeup();
    }

    /// Blocks until the runtime's globals are ready. Parents call this
    /// before the first IPC send to a child.
    pub fn await_initialized(&self) {
        self.shared.initialized.wait();
    }

    /// The selector behind this runtime.
    #[must_use]
    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.shared.selector
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("pending_ticks", &self.shared.ticks.len())
            .field("pin_count", &self.shared.pins.count())
            .field("cancelled", &self.shared.is_cancelled())
            .finish()
    }
}

/// Why the loop stopped mid-iteration.
enum Abort {
    Exit(i32),
    Fatal(RuntimeError),
}

/// One script's event loop and runtime context.
pub struct ScriptRuntime {
    state: RuntimeState,
    shared: Arc<Shared>,
    registry: Arc<dyn ModuleRegistry + Send + Sync>,
    timing: TimingWindow,
    source: ScriptSource,
    args: Vec<String>,
    events: Events,
    ipc_connected: bool,
    // Owned pools; dropped (and shut down) with the runtime. The async pool
    // is absent when the sandbox supplied a shared one.
    async_pool: Option<AsyncPool>,
    unbounded_pool: UnboundedPool,
}

impl ScriptRuntime {
    /// Creates a runtime on a fresh OS selector.
    ///
    /// # Errors
    ///
    /// Fails when the OS poller cannot be opened or the sandbox working
    /// directory is invalid.
    pub fn new(
        source: ScriptSource,
        args: Vec<String>,
        process: Box<dyn Process>,
        registry: Arc<dyn ModuleRegistry + Send + Sync>,
        sandbox: Sandbox,
        config: RuntimeConfig,
    ) -> io::Result<Self> {
        let selector: Arc<dyn Selector> = Arc::new(PollSelector::new()?);
        Self::with_selector(source, args, process, registry, sandbox, config, selector)
    }

    /// Creates a runtime on a caller-supplied selector.
    ///
    /// # Errors
    ///
    /// Fails when the sandbox working directory is invalid.
    pub fn with_selector(
        source: ScriptSource,
        args: Vec<String>,
        process: Box<dyn Process>,
        registry: Arc<dyn ModuleRegistry + Send + Sync>,
        sandbox: Sandbox,
        mut config: RuntimeConfig,
        selector: Arc<dyn Selector>,
    ) -> io::Result<Self> {
        config.normalize();

        let Sandbox {
            filesystem_root,
            working_directory,
            mounts,
            async_pool,
            stdin,
            stdout,
            stderr,
            network_policy,
        } = sandbox;

        let mut path = PathTranslator::new();
        if let Some(root) = &filesystem_root {
            path.set_root(root.clone());
        }
        let working_dir = match (working_directory, &filesystem_root) {
            (Some(dir), _) => dir,
            (None, Some(_)) => "/".to_string(),
            (None, None) => std::env::current_dir()
                .map_or_else(|_| "/".to_string(), |d| d.display().to_string()),
        };
        path.set_working_dir(&working_dir)?;
        for (prefix, physical) in &mounts {
            path.mount(prefix, physical.clone());
        }

        let shared = Arc::new(Shared::new(selector));
        let unbounded_pool = UnboundedPool::new(&config.thread_name_prefix);
        let (owned_async, async_handle) = match async_pool {
            Some(handle) => (None, handle),
            None => {
                let pool = AsyncPool::new(
                    config.async_pool_threads,
                    config.async_pool_queue,
                    &config.thread_name_prefix,
                );
                let handle = pool.handle();
                (Some(pool), handle)
            }
        };

        let state = RuntimeState::new(
            process,
            Arc::clone(&registry),
            Arc::clone(&shared),
            path,
            async_handle,
            unbounded_pool.handle(),
            StdioOverrides {
                stdin,
                stdout,
                stderr,
            },
            network_policy,
        );

        Ok(Self {
            state,
            shared,
            registry,
            timing: TimingWindow::new(config.script_time_limit),
            source,
            args,
            events: Events::with_capacity(64),
            ipc_connected: false,
            async_pool: owned_async,
            unbounded_pool,
        })
    }

    /// A cross-thread producer handle.
    #[must_use]
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle::new(Arc::clone(&self.shared))
    }

    /// The loop-thread state, for embedder setup before `run`.
    pub fn state(&mut self) -> &mut RuntimeState {
        &mut self.state
    }

    /// Records that an IPC parent is attached; reflected on the process
    /// object during initialization.
    pub fn set_ipc_connected(&mut self, connected: bool) {
        self.ipc_connected = connected;
    }

    /// Runs the script to completion.
    ///
    /// Initializes process globals, executes the bootstrap script, drives the
    /// loop until the termination predicate holds, then performs the shutdown
    /// sequence. Call on a dedicated thread; this blocks until the script is
    /// done.
    pub fn run(&mut self) -> ScriptStatus {
        self.state.now_ms = timing::now_millis();
        let status = self.boot_and_loop();
        let status = self.finish(status);
        debug!(%status, "script exiting");
        status
    }

    fn boot_and_loop(&mut self) -> ScriptStatus {
        let init = self.init_process();
        // Released exactly once, error or not, so parents never hang.
        self.shared.initialized.open();
        if let Err(e) = init {
            return ScriptStatus::Failed(RuntimeError::new(
                RuntimeErrorKind::Config,
                e.to_string(),
            ));
        }

        // The bootstrap script: it interprets argv, loads the user script,
        // and typically leaves ticks behind for the loop to run.
        let mut main = self.registry.main_script();
        let guard = self.timing.start();
        let result = main(&mut self.state);
        drop(guard);
        if let Err(e) = result {
            match self.consume_or_abort(e) {
                Ok(()) => {}
                Err(Abort::Exit(code)) => return ScriptStatus::Exited(code),
                Err(Abort::Fatal(error)) => return ScriptStatus::Failed(error),
            }
        }

        self.main_loop()
    }

    fn init_process(&mut self) -> Result<(), FlagError> {
        self.state.process.set_connected(self.ipc_connected);

        match self.source.clone() {
            ScriptSource::Repl { force } => {
                let parsed = flags::split_raw_argv(&self.args);
                let mut argv = Vec::with_capacity(parsed.argv.len() + 1);
                argv.push(EXECUTABLE_NAME.to_string());
                argv.extend(parsed.argv);
                self.state.process.set_force_repl(force);
                self.state.process.set_argv(argv);
                self.state.process.set_exec_argv(parsed.exec_argv.clone());
                flags::apply_vm_flags(&mut *self.state.process, &parsed.exec_argv)
            }
            ScriptSource::Inline {
                name,
                source,
                print_result,
            } => {
                self.state.process.set_eval(source, print_result);
                self.set_script_argv(name);
                Ok(())
            }
            ScriptSource::File { path } => {
                let name = self.state.reverse_translate_path(&path).unwrap_or_else(|e| {
                    debug!(error = %e, "script path has no virtual form; using it verbatim");
                    path.display().to_string()
                });
                self.set_script_argv(name);
                Ok(())
            }
        }
    }

    /// `argv = [executable, script, args...]`, no VM flags consumed.
    fn set_script_argv(&mut self, script_name: String) {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push(EXECUTABLE_NAME.to_string());
        argv.push(script_name);
        argv.extend(self.args.iter().cloned());
        self.state.process.set_argv(argv);
        self.state.process.set_exec_argv(Vec::new());
    }

    fn main_loop(&mut self) -> ScriptStatus {
        // The loop lives while anything still wants it: queued ticks, pins,
        // or pending next-tick/immediate work on the process object.
        loop {
            let alive = !self.shared.ticks.is_empty()
                || self.shared.pins.is_pinned()
                || self.state.process.is_tick_task_pending()
                || self.state.process.is_immediate_task_pending();
            if !alive {
                return ScriptStatus::OK;
            }
            if self.shared.is_cancelled() {
                return ScriptStatus::Cancelled;
            }

            if let Err(abort) = self.turn() {
                return match abort {
                    Abort::Exit(code) => ScriptStatus::Exited(code),
                    Abort::Fatal(error) => ScriptStatus::Failed(error),
                };
            }
        }
    }

    fn turn(&mut self) -> Result<(), Abort> {
        self.execute_next_ticks()?;
        self.execute_ticks()?;
        self.execute_immediates()?;

        self.state.now_ms = timing::now_millis();
        let timeout_ms = self.poll_timeout_ms();
        self.select(timeout_ms)?;

        self.execute_io()?;
        self.execute_timers()?;
        Ok(())
    }

    fn poll_timeout_ms(&self) -> u64 {
        if !self.shared.ticks.is_empty()
            || self.state.process.is_tick_task_pending()
            || self.state.process.is_immediate_task_pending()
            || !self.shared.pins.is_pinned()
        {
            // Immediate work, or no reason to keep the loop open: keep
            // spinning so termination is re-checked without delay.
            0
        } else {
            match self.state.timers.peek_deadline() {
                None => DEFAULT_DELAY_MS,
                Some(deadline) => deadline.saturating_sub(self.state.now_ms),
            }
        }
    }

    fn select(&mut self, timeout_ms: u64) -> Result<(), Abort> {
        let result = if timeout_ms > 0 {
            trace!(
                timeout_ms,
                pin_count = self.shared.pins.count(),
                "main loop sleeping"
            );
            self.shared
                .selector
                .select(&mut self.events, Some(Duration::from_millis(timeout_ms)))
        } else {
            self.shared.selector.select_now(&mut self.events)
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(Abort::Fatal(e.into())),
        }
    }

    /// Phase 2: the process object drains `process.nextTick` work fully.
    fn execute_next_ticks(&mut self) -> Result<(), Abort> {
        if !self.state.process.is_tick_task_pending() {
            return Ok(());
        }
        trace!("executing next-tick tasks");
        let guard = self.timing.start();
        let result = self.state.process.process_tick_tasks();
        drop(guard);
        if let Err(e) = result {
            self.consume_or_abort(e)?;
        }
        Ok(())
    }

    /// Phase 3: drain the tick queue.
    ///
    /// A consumed fatal ends the drain for this iteration; the rest of the
    /// queue waits for the next one so timers and I/O still get their turn.
    fn execute_ticks(&mut self) -> Result<(), Abort> {
        while let Some(mut activity) = self.shared.ticks.pop() {
            if activity.is_cancelled() {
                continue;
            }
            let guard = self.timing.start();
            let result = dispatch(&mut self.state, &mut activity);
            drop(guard);
            if let Err(e) = result {
                self.consume_or_abort(e)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Phase 4: the process object drains `setImmediate` work fully.
    fn execute_immediates(&mut self) -> Result<(), Abort> {
        if !self.state.process.is_immediate_task_pending() {
            return Ok(());
        }
        trace!("executing immediate tasks");
        let guard = self.timing.start();
        let result = self.state.process.process_immediate_tasks();
        drop(guard);
        if let Err(e) = result {
            self.consume_or_abort(e)?;
        }
        Ok(())
    }

    /// Phase 7: invoke each selected key's handler exactly once.
    fn execute_io(&mut self) -> Result<(), Abort> {
        let events = std::mem::take(&mut self.events);
        let mut outcome = Ok(());
        for event in &events {
            let Some(handler) = self.state.handler(event.token) else {
                trace!(token = ?event.token, "readiness for a detached token");
                continue;
            };
            let guard = self.timing.start();
            let result = handler.lock().selected(*event, &mut self.state);
            drop(guard);
            if let Err(e) = result {
                if let Err(abort) = self.consume_or_abort(e) {
                    outcome = Err(abort);
                    break;
                }
            }
        }
        self.events = events;
        outcome
    }

    /// Phase 8: fire every timer whose deadline has passed, re-arming
    /// repeating ones from the refreshed `now`.
    fn execute_timers(&mut self) -> Result<(), Abort> {
        self.state.now_ms = timing::now_millis();
        let now = self.state.now_ms;

        while let Some(mut activity) = self.state.timers.pop_due(now) {
            if activity.is_cancelled() {
                continue;
            }
            trace!(seq = activity.seq, "executing timer");
            let guard = self.timing.start();
            let result = dispatch(&mut self.state, &mut activity);
            drop(guard);
            if let Err(e) = result {
                self.consume_or_abort(e)?;
            }
            if activity.repeating && !activity.is_cancelled() {
                activity.rearm(now);
                trace!(
                    seq = activity.seq,
                    deadline_ms = activity.deadline_ms,
                    "re-registering repeating timer"
                );
                self.state.timers.insert(activity);
            }
        }
        Ok(())
    }

    /// The script-exception boundary.
    ///
    /// Deliberate exits always propagate. Anything else is offered to the
    /// fatal handler with the timing window already closed (so the handler
    /// itself is never timed out); its verdict decides whether the loop
    /// continues.
    fn consume_or_abort(&mut self, error: ScriptError) -> Result<(), Abort> {
        match error {
            ScriptError::Exit(code) => Err(Abort::Exit(code)),
            ScriptError::Js(js) => {
                timing::clear_current();
                debug!(error = %js, "offering uncaught exception to the fatal handler");
                match self.state.process.handle_fatal(&js) {
                    Ok(true) => {
                        debug!("fatal handler consumed the exception");
                        Ok(())
                    }
                    Ok(false) => Err(Abort::Fatal(RuntimeError::script(js))),
                    Err(ScriptError::Exit(code)) => Err(Abort::Exit(code)),
                    Err(ScriptError::Js(inner)) => Err(Abort::Fatal(RuntimeError::script(inner))),
                }
            }
        }
    }

    /// The shutdown sequence: `exit` event (honoring re-entrant
    /// `process.exit`), cleanup hooks, leaked handles, non-standard stdio.
    fn finish(&mut self, mut status: ScriptStatus) -> ScriptStatus {
        if status.cause().is_none() && !self.state.process.is_exiting() {
            self.state.process.set_exiting(true);
            let code = status.exit_code();
            match self
                .state
                .process
                .emit_event("exit", ScriptValue::Number(f64::from(code)))
            {
                Ok(()) => {}
                Err(ScriptError::Exit(code)) => {
                    debug!(code, "exit handler replaced the exit code");
                    status = ScriptStatus::Exited(code);
                }
                Err(ScriptError::Js(js)) => {
                    status = ScriptStatus::Failed(RuntimeError::script(js));
                }
            }
        }

        // The filesystem module owns descriptor cleanup, so it is resolved
        // before leaked handles are closed. Resolution is lenient: shutdown
        // can arrive before initialization ever loaded the module, and that
        // is not an error. Factory failures are swallowed like every other
        // shutdown error.
        match self.state.try_require_internal("fs") {
            Ok(Some(_)) => {}
            Ok(None) => trace!("no filesystem module to clean up"),
            Err(e) => debug!(error = %e, "filesystem cleanup failed during shutdown"),
        }

        self.state.close_open_handles();
        self.state.close_stdio();

        if let Some(pool) = &self.async_pool {
            pool.shutdown();
        }
        self.unbounded_pool.shutdown();
        status
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("source", &self.source)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Executes one Activity against the runtime state.
pub(crate) fn dispatch(
    state: &mut RuntimeState,
    activity: &mut Activity,
) -> Result<(), ScriptError> {
    match &mut activity.payload {
        // Domain handling for callbacks belongs to the tick submitter.
        Payload::Callback(call) => {
            let call = call.clone();
            let domain = activity.domain.clone();
            state.process.submit_tick(call, domain)
        }
        Payload::Task(task) => run_in_domain(activity.domain.clone(), || task(state)),
        Payload::Runnable(run) => run_in_domain(activity.domain.clone(), || {
            run();
            Ok(())
        }),
        Payload::TimerInstall(slot) => {
            if let Some(timer) = slot.take() {
                // Cancelled before installation: never enters the heap.
                if !timer.is_cancelled() {
                    state.timers.insert(*timer);
                }
            }
            Ok(())
        }
    }
}

/// Domain guard around a task body.
///
/// A disposed domain is dropped for this run only. The exit call happens on
/// normal return alone: on a raise, the error handler must still observe the
/// active domain.
fn run_in_domain(
    domain: Option<DomainRef>,
    body: impl FnOnce() -> Result<(), ScriptError>,
) -> Result<(), ScriptError> {
    let domain = domain.filter(|d| !d.is_disposed());
    if let Some(d) = &domain {
        trace!("entering domain");
        d.enter()?;
    }
    body()?;
    if let Some(d) = &domain {
        trace!("exiting domain");
        d.exit()?;
    }
    Ok(())
}

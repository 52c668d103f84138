//! Shared helpers for unit and integration tests.
//!
//! Provides logging initialization, phase/section/assertion macros for
//! readable test output, plus scripted stand-ins for the external
//! collaborators: a [`TestProcess`] whose queues and handlers tests can load
//! before (and inspect after) a run, a [`TestRegistry`] with a configurable
//! main script, and a [`TestDomain`] that records enter/exit transitions.

use crate::error::{JsError, ScriptError};
use crate::process::{CallbackInvocation, Domain, DomainRef, ModuleRegistry, Process};
use crate::runtime::activity::ScriptTask;
use crate::runtime::state::RuntimeState;
use crate::value::ScriptValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

static INIT_LOGGING: Once = Once::new();

/// Initializes test logging. Safe to call repeatedly; the first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

type QueuedTask = Box<dyn FnOnce() -> Result<(), ScriptError> + Send>;
type FatalHandler = Box<dyn FnMut(&JsError) -> Result<bool, ScriptError> + Send>;
type ExitHandler = Box<dyn FnMut(i32) -> Result<(), ScriptError> + Send>;
type TickSubmitter =
    Box<dyn FnMut(CallbackInvocation, Option<DomainRef>) -> Result<(), ScriptError> + Send>;

#[derive(Default)]
struct TestProcessInner {
    next_ticks: VecDeque<QueuedTask>,
    immediates: VecDeque<QueuedTask>,
    fatal_handler: Option<FatalHandler>,
    exit_handler: Option<ExitHandler>,
    tick_submitter: Option<TickSubmitter>,
    domain: Option<DomainRef>,
    events: Vec<(String, ScriptValue)>,
    submitted: Vec<CallbackInvocation>,
    exiting: bool,
    connected: Option<bool>,
    argv: Vec<String>,
    exec_argv: Vec<String>,
    eval: Option<(String, bool)>,
    force_repl: bool,
    gc_installed: bool,
    throw_deprecation: Option<bool>,
    trace_deprecation: Option<bool>,
}

/// Scripted process object. Cloning shares state, so tests keep a clone to
/// load queues and inspect results while the runtime owns the original.
#[derive(Clone, Default)]
pub struct TestProcess {
    inner: Arc<Mutex<TestProcessInner>>,
}

impl TestProcess {
    /// Creates an empty process double.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TestProcessInner> {
        self.inner.lock().expect("test process poisoned")
    }

    /// Queues a next-tick microtask.
    pub fn push_next_tick(&self, f: impl FnOnce() + Send + 'static) {
        self.lock().next_ticks.push_back(Box::new(move || {
            f();
            Ok(())
        }));
    }

    /// Queues a next-tick microtask that may raise.
    pub fn push_next_tick_failing(
        &self,
        f: impl FnOnce() -> Result<(), ScriptError> + Send + 'static,
    ) {
        self.lock().next_ticks.push_back(Box::new(f));
    }

    /// Queues an immediate.
    pub fn push_immediate(&self, f: impl FnOnce() + Send + 'static) {
        self.lock().immediates.push_back(Box::new(move || {
            f();
            Ok(())
        }));
    }

    /// Installs the fatal handler.
    pub fn set_fatal_handler(
        &self,
        f: impl FnMut(&JsError) -> Result<bool, ScriptError> + Send + 'static,
    ) {
        self.lock().fatal_handler = Some(Box::new(f));
    }

    /// Installs a handler invoked when the `exit` event fires.
    pub fn set_exit_handler(&self, f: impl FnMut(i32) -> Result<(), ScriptError> + Send + 'static) {
        self.lock().exit_handler = Some(Box::new(f));
    }

    /// Replaces the default record-only tick submitter.
    pub fn set_tick_submitter(
        &self,
        f: impl FnMut(CallbackInvocation, Option<DomainRef>) -> Result<(), ScriptError>
            + Send
            + 'static,
    ) {
        self.lock().tick_submitter = Some(Box::new(f));
    }

    /// Sets the active domain.
    pub fn set_domain(&self, domain: DomainRef) {
        self.lock().domain = Some(domain);
    }

    /// Events emitted so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, ScriptValue)> {
        self.lock().events.clone()
    }

    /// Callback invocations recorded by the default tick submitter.
    #[must_use]
    pub fn submitted(&self) -> Vec<CallbackInvocation> {
        self.lock().submitted.clone()
    }

    /// True once `--expose-gc` installed the hook.
    #[must_use]
    pub fn gc_installed(&self) -> bool {
        self.lock().gc_installed
    }

    /// Last value set for `throwDeprecation`.
    #[must_use]
    pub fn throw_deprecation(&self) -> Option<bool> {
        self.lock().throw_deprecation
    }

    /// Last value set for `traceDeprecation`.
    #[must_use]
    pub fn trace_deprecation(&self) -> Option<bool> {
        self.lock().trace_deprecation
    }

    /// `process.argv` as last set.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        self.lock().argv.clone()
    }

    /// `process.execArgv` as last set.
    #[must_use]
    pub fn exec_argv(&self) -> Vec<String> {
        self.lock().exec_argv.clone()
    }

    /// Eval source and print flag, when the run was inline.
    #[must_use]
    pub fn eval(&self) -> Option<(String, bool)> {
        self.lock().eval.clone()
    }

    /// Whether the REPL was forced.
    #[must_use]
    pub fn force_repl(&self) -> bool {
        self.lock().force_repl
    }

    /// IPC connection flag, when set.
    #[must_use]
    pub fn connected(&self) -> Option<bool> {
        self.lock().connected
    }

    fn drain(
        &self,
        queue: fn(&mut TestProcessInner) -> &mut VecDeque<QueuedTask>,
    ) -> Result<(), ScriptError> {
        loop {
            let task = {
                let mut inner = self.lock();
                queue(&mut inner).pop_front()
            };
            match task {
                Some(task) => task()?,
                None => return Ok(()),
            }
        }
    }
}

impl Process for TestProcess {
    fn is_tick_task_pending(&self) -> bool {
        !self.lock().next_ticks.is_empty()
    }

    fn is_immediate_task_pending(&self) -> bool {
        !self.lock().immediates.is_empty()
    }

    fn process_tick_tasks(&mut self) -> Result<(), ScriptError> {
        self.drain(|inner| &mut inner.next_ticks)
    }

    fn process_immediate_tasks(&mut self) -> Result<(), ScriptError> {
        self.drain(|inner| &mut inner.immediates)
    }

    fn submit_tick(
        &mut self,
        call: CallbackInvocation,
        domain: Option<DomainRef>,
    ) -> Result<(), ScriptError> {
        let submitter = self.lock().tick_submitter.take();
        match submitter {
            Some(mut submitter) => {
                let result = submitter(call, domain);
                self.lock().tick_submitter = Some(submitter);
                result
            }
            None => {
                self.lock().submitted.push(call);
                Ok(())
            }
        }
    }

    fn domain(&self) -> Option<DomainRef> {
        self.lock().domain.clone()
    }

    fn handle_fatal(&mut self, error: &JsError) -> Result<bool, ScriptError> {
        let handler = self.lock().fatal_handler.take();
        match handler {
            Some(mut handler) => {
                let verdict = handler(error);
                self.lock().fatal_handler = Some(handler);
                verdict
            }
            None => Ok(false),
        }
    }

    fn emit_event(&mut self, event: &str, payload: ScriptValue) -> Result<(), ScriptError> {
        self.lock().events.push((event.to_string(), payload.clone()));
        if event == "exit" {
            let handler = self.lock().exit_handler.take();
            if let Some(mut handler) = handler {
                let code = match payload {
                    ScriptValue::Number(n) => n as i32,
                    _ => 0,
                };
                let result = handler(code);
                self.lock().exit_handler = Some(handler);
                return result;
            }
        }
        Ok(())
    }

    fn is_exiting(&self) -> bool {
        self.lock().exiting
    }

    fn set_exiting(&mut self, exiting: bool) {
        self.lock().exiting = exiting;
    }

    fn set_connected(&mut self, connected: bool) {
        self.lock().connected = Some(connected);
    }

    fn set_argv(&mut self, argv: Vec<String>) {
        self.lock().argv = argv;
    }

    fn set_exec_argv(&mut self, argv: Vec<String>) {
        self.lock().exec_argv = argv;
    }

    fn set_eval(&mut self, source: String, print_result: bool) {
        self.lock().eval = Some((source, print_result));
    }

    fn set_force_repl(&mut self, force: bool) {
        self.lock().force_repl = force;
    }

    fn set_throw_deprecation(&mut self, on: bool) {
        self.lock().throw_deprecation = Some(on);
    }

    fn set_trace_deprecation(&mut self, on: bool) {
        self.lock().trace_deprecation = Some(on);
    }

    fn install_gc_global(&mut self) {
        self.lock().gc_installed = true;
    }
}

type ModuleFactory =
    Box<dyn Fn(&mut RuntimeState) -> Result<ScriptValue, ScriptError> + Send + Sync>;

/// Scripted module registry with a configurable main script.
#[derive(Default)]
pub struct TestRegistry {
    main: Mutex<Option<ScriptTask>>,
    modules: Mutex<HashMap<String, ModuleFactory>>,
    internal_modules: Mutex<HashMap<String, ModuleFactory>>,
}

impl TestRegistry {
    /// Creates a registry whose main script does nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bootstrap script run at startup.
    pub fn set_main(&self, main: ScriptTask) {
        *self.main.lock().expect("registry poisoned") = Some(main);
    }

    /// Registers a public module factory.
    pub fn add_module(
        &self,
        name: &str,
        factory: impl Fn(&mut RuntimeState) -> Result<ScriptValue, ScriptError>
            + Send
            + Sync
            + 'static,
    ) {
        self.modules
            .lock()
            .expect("registry poisoned")
            .insert(name.to_string(), Box::new(factory));
    }

    /// Registers an internal module factory.
    pub fn add_internal_module(
        &self,
        name: &str,
        factory: impl Fn(&mut RuntimeState) -> Result<ScriptValue, ScriptError>
            + Send
            + Sync
            + 'static,
    ) {
        self.internal_modules
            .lock()
            .expect("registry poisoned")
            .insert(name.to_string(), Box::new(factory));
    }
}

impl ModuleRegistry for TestRegistry {
    fn main_script(&self) -> ScriptTask {
        self.main
            .lock()
            .expect("registry poisoned")
            .take()
            .unwrap_or_else(|| Box::new(|_| Ok(())))
    }

    fn init_module(
        &self,
        name: &str,
        state: &mut RuntimeState,
    ) -> Option<Result<ScriptValue, ScriptError>> {
        let modules = self.modules.lock().expect("registry poisoned");
        modules.get(name).map(|factory| factory(state))
    }

    fn init_internal_module(
        &self,
        name: &str,
        state: &mut RuntimeState,
    ) -> Option<Result<ScriptValue, ScriptError>> {
        let modules = self.internal_modules.lock().expect("registry poisoned");
        modules.get(name).map(|factory| factory(state))
    }
}

/// Domain double recording transitions into a shared trace.
pub struct TestDomain {
    trace: Arc<Mutex<Vec<String>>>,
    name: String,
    disposed: AtomicBool,
}

impl TestDomain {
    /// Creates a domain writing `enter:<name>`/`exit:<name>` markers into
    /// `trace`.
    #[must_use]
    pub fn new(name: &str, trace: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            trace,
            name: name.to_string(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Marks the domain disposed.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl Domain for TestDomain {
    fn enter(&self) -> Result<(), ScriptError> {
        self.trace
            .lock()
            .expect("trace poisoned")
            .push(format!("enter:{}", self.name));
        Ok(())
    }

    fn exit(&self) -> Result<(), ScriptError> {
        self.trace
            .lock()
            .expect("trace poisoned")
            .push(format!("exit:{}", self.name));
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

//! Single-threaded runtime state.
//!
//! Everything the loop thread owns exclusively lives here: the process object,
//! the timer heap and its sequence, the selector handler table, registered
//! closeables, module caches, the errno slot, the path translator, and the
//! loop timestamp. Tasks receive `&mut RuntimeState` at execution time instead
//! of holding back-references to the runtime, so the ownership story stays
//! one-directional.
//!
//! Cross-thread state (tick queue, pin counter, cancellation, init latch)
//! lives behind the shared handle; the accessors here forward to it.

use crate::error::{JsError, ScriptError};
use crate::path::PathTranslator;
use crate::process::{Closeable, ModuleRegistry, Process};
use crate::runtime::activity::{Activity, ActivityHandle, ScriptTask};
use crate::runtime::driver::{RuntimeHandle, Shared};
use crate::runtime::pools::{AsyncPoolHandle, UnboundedPoolHandle};
use crate::runtime::selector::{Selector, SelectorHandler, Token};
use crate::runtime::timer_heap::TimerHeap;
use crate::runtime::timing;
use crate::sandbox::NetworkPolicy;
use crate::value::ScriptValue;
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifier returned by [`RuntimeState::register_closeable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseableId(u64);

pub(crate) type HandlerRef = Arc<PlMutex<Box<dyn SelectorHandler>>>;

/// Stdio replacements taken from the sandbox.
#[derive(Default)]
pub(crate) struct StdioOverrides {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Option<Box<dyn Write + Send>>,
    pub stderr: Option<Box<dyn Write + Send>>,
}

/// The loop thread's exclusive state.
pub struct RuntimeState {
    pub(crate) process: Box<dyn Process>,
    pub(crate) timers: TimerHeap,
    pub(crate) now_ms: u64,
    pub(crate) shared: Arc<Shared>,
    handlers: HashMap<Token, HandlerRef>,
    open_handles: HashMap<u64, Box<dyn Closeable>>,
    next_closeable_id: u64,
    cleanup_hooks: Vec<Box<dyn FnOnce() + Send>>,
    module_cache: HashMap<String, ScriptValue>,
    internal_module_cache: HashMap<String, ScriptValue>,
    registry: Arc<dyn ModuleRegistry + Send + Sync>,
    path: PathTranslator,
    errno: Option<ScriptValue>,
    async_pool: AsyncPoolHandle,
    unbounded_pool: UnboundedPoolHandle,
    pub(crate) stdio: StdioOverrides,
    network_policy: Option<NetworkPolicy>,
}

impl RuntimeState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        process: Box<dyn Process>,
        registry: Arc<dyn ModuleRegistry + Send + Sync>,
        shared: Arc<Shared>,
        path: PathTranslator,
        async_pool: AsyncPoolHandle,
        unbounded_pool: UnboundedPoolHandle,
        stdio: StdioOverrides,
        network_policy: Option<NetworkPolicy>,
    ) -> Self {
        Self {
            process,
            timers: TimerHeap::new(),
            now_ms: timing::now_millis(),
            shared,
            handlers: HashMap::new(),
            open_handles: HashMap::new(),
            next_closeable_id: 0,
            cleanup_hooks: Vec::new(),
            module_cache: HashMap::new(),
            internal_module_cache: HashMap::new(),
            registry,
            path,
            errno: None,
            async_pool,
            unbounded_pool,
            stdio,
            network_policy,
        }
    }

    /// The loop timestamp: refreshed by the driver, stable within a phase.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// The process object.
    pub fn process(&mut self) -> &mut dyn Process {
        &mut *self.process
    }

    /// A cross-thread producer handle for this runtime.
    #[must_use]
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle::new(Arc::clone(&self.shared))
    }

    /// The selector driving this loop.
    #[must_use]
    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.shared.selector
    }

    /// Bounded pool for promptly-finishing blocking work.
    #[must_use]
    pub fn async_pool(&self) -> &AsyncPoolHandle {
        &self.async_pool
    }

    /// Unbounded pool for indefinitely blocking work.
    #[must_use]
    pub fn unbounded_pool(&self) -> &UnboundedPoolHandle {
        &self.unbounded_pool
    }

    /// The sandbox network admission predicate, when one is configured.
    #[must_use]
    pub fn network_policy(&self) -> Option<&NetworkPolicy> {
        self.network_policy.as_ref()
    }

    /// Marks one external reason to keep the loop alive.
    pub fn pin(&self) {
        self.shared.pins.pin();
    }

    /// Releases one liveness reason, waking the selector on the zero
    /// transition so termination is re-evaluated.
    pub fn unpin(&self) {
        self.shared.unpin();
    }

    // --- timers -----------------------------------------------------------

    /// Schedules a timer directly on the heap. Loop thread only; producer
    /// threads go through
    /// [`RuntimeHandle::create_timed_task`](crate::runtime::RuntimeHandle::create_timed_task).
    pub fn create_timer(
        &mut self,
        delay_ms: u64,
        repeating: bool,
        interval_ms: u64,
        task: ScriptTask,
    ) -> ActivityHandle {
        let mut activity = Activity::task(task, None);
        let deadline = timing::now_millis() + delay_ms;
        activity.arm(deadline, repeating, interval_ms);
        let handle = activity.handle();
        let seq = self.timers.insert(activity);
        trace!(seq, deadline_ms = deadline, repeating, "timer scheduled");
        self.shared.selector.wakeup();
        handle
    }

    // --- selector handlers ------------------------------------------------

    /// Attaches the readiness handler for a token.
    pub fn attach_handler(&mut self, token: Token, handler: Box<dyn SelectorHandler>) {
        self.handlers.insert(token, Arc::new(PlMutex::new(handler)));
    }

    /// Detaches the handler for a token.
    pub fn detach_handler(&mut self, token: Token) {
        self.handlers.remove(&token);
    }

    pub(crate) fn handler(&self, token: Token) -> Option<HandlerRef> {
        self.handlers.get(&token).cloned()
    }

    // --- open handles -----------------------------------------------------

    /// Registers a resource to be closed when the script ends.
    pub fn register_closeable(&mut self, closeable: Box<dyn Closeable>) -> CloseableId {
        let id = CloseableId(self.next_closeable_id);
        self.next_closeable_id += 1;
        self.open_handles.insert(id.0, closeable);
        id
    }

    /// Removes a previously registered resource without closing it.
    pub fn unregister_closeable(&mut self, id: CloseableId) -> Option<Box<dyn Closeable>> {
        self.open_handles.remove(&id.0)
    }

    /// Registers a hook to run at shutdown before leaked handles are closed.
    pub fn add_cleanup_hook(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.cleanup_hooks.push(hook);
    }

    /// Runs cleanup hooks, then closes every still-registered handle.
    /// Shutdown only; errors are logged, never propagated.
    pub(crate) fn close_open_handles(&mut self) {
        for hook in self.cleanup_hooks.drain(..) {
            hook();
        }
        for (_, mut closeable) in self.open_handles.drain() {
            debug!(handle = closeable.describe(), "closing leaked handle");
            if let Err(e) = closeable.close() {
                debug!(handle = closeable.describe(), error = %e, "error closing leaked handle");
            }
        }
    }

    /// Flushes and drops sandbox-supplied stdio. Errors are swallowed.
    pub(crate) fn close_stdio(&mut self) {
        if let Some(mut out) = self.stdio.stdout.take() {
            if let Err(e) = out.flush() {
                debug!(error = %e, "error closing stdout override");
            }
        }
        if let Some(mut err) = self.stdio.stderr.take() {
            if let Err(e) = err.flush() {
                debug!(error = %e, "error closing stderr override");
            }
        }
        self.stdio.stdin = None;
    }

    /// The sandbox stdout replacement, if one was configured.
    pub fn stdout_override(&mut self) -> Option<&mut (dyn Write + Send + '_)> {
        match &mut self.stdio.stdout {
            Some(w) => Some(w.as_mut()),
            None => None,
        }
    }

    /// The sandbox stderr replacement, if one was configured.
    pub fn stderr_override(&mut self) -> Option<&mut (dyn Write + Send + '_)> {
        match &mut self.stdio.stderr {
            Some(w) => Some(w.as_mut()),
            None => None,
        }
    }

    /// The sandbox stdin replacement, if one was configured.
    pub fn stdin_override(&mut self) -> Option<&mut (dyn Read + Send + '_)> {
        match &mut self.stdio.stdin {
            Some(r) => Some(r.as_mut()),
            None => None,
        }
    }

    // --- errno ------------------------------------------------------------

    /// Publishes `errno` on the script scope.
    pub fn set_errno(&mut self, err: impl Into<String>) {
        self.errno = Some(ScriptValue::string(err.into()));
    }

    /// Resets `errno` to zero.
    pub fn clear_errno(&mut self) {
        self.errno = Some(ScriptValue::Number(0.0));
    }

    /// Reads `errno`; `undefined` when never set.
    #[must_use]
    pub fn errno(&self) -> ScriptValue {
        self.errno.clone().unwrap_or(ScriptValue::Undefined)
    }

    // --- modules ----------------------------------------------------------

    /// Loads a public module through the registry, caching its exports.
    ///
    /// # Errors
    ///
    /// Raises a script error for unknown modules or failed initialization.
    pub fn require(&mut self, name: &str) -> Result<ScriptValue, ScriptError> {
        if let Some(exports) = self.module_cache.get(name) {
            return Ok(exports.clone());
        }
        let registry = Arc::clone(&self.registry);
        match registry.init_module(name, self) {
            Some(Ok(exports)) => {
                self.module_cache.insert(name.to_string(), exports.clone());
                Ok(exports)
            }
            Some(Err(e)) => Err(e),
            None => Err(ScriptError::Js(JsError::msg(format!(
                "Cannot find module '{name}'"
            )))),
        }
    }

    /// Loads an internal (`process.binding`-style) module, caching it.
    ///
    /// # Errors
    ///
    /// Raises a script error for unknown modules or failed initialization.
    pub fn require_internal(&mut self, name: &str) -> Result<ScriptValue, ScriptError> {
        match self.try_require_internal(name)? {
            Some(exports) => Ok(exports),
            None => Err(ScriptError::Js(JsError::msg(format!(
                "No such internal module '{name}'"
            )))),
        }
    }

    /// Lenient form of [`require_internal`](Self::require_internal): an
    /// unknown module yields `Ok(None)` instead of a raise.
    ///
    /// Shutdown can run before initialization ever loaded a module, and
    /// asking for one that does not exist yet is not an error in that
    /// window. The driver uses this to resolve the filesystem module during
    /// the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Raises only when a known module's factory fails.
    pub fn try_require_internal(
        &mut self,
        name: &str,
    ) -> Result<Option<ScriptValue>, ScriptError> {
        if let Some(exports) = self.internal_module_cache.get(name) {
            return Ok(Some(exports.clone()));
        }
        let registry = Arc::clone(&self.registry);
        match registry.init_internal_module(name, self) {
            Some(Ok(exports)) => {
                self.internal_module_cache
                    .insert(name.to_string(), exports.clone());
                Ok(Some(exports))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    // --- paths ------------------------------------------------------------

    /// Maps a script-visible path to the physical path I/O should use.
    ///
    /// # Errors
    ///
    /// Fails when the path escapes the sandbox root.
    pub fn translate_path(&self, path: &str) -> std::io::Result<PathBuf> {
        // NIO-style UNC prefixes confuse downstream path handling.
        let path = path.strip_prefix(r"\\?\").unwrap_or(path);
        self.path.translate(path)
    }

    /// Maps a physical path back to what the script should see.
    ///
    /// # Errors
    ///
    /// Fails when the physical path lies outside the root and every mount.
    pub fn reverse_translate_path(&self, path: &Path) -> std::io::Result<String> {
        self.path.reverse_translate(path)
    }

    /// The current virtual working directory.
    #[must_use]
    pub fn working_directory(&self) -> &str {
        self.path.working_dir()
    }

    /// Updates the working directory; relative paths resolve against the
    /// current one.
    ///
    /// # Errors
    ///
    /// Fails when the new directory escapes the sandbox root.
    pub fn set_working_directory(&mut self, dir: &str) -> std::io::Result<()> {
        self.path.set_working_dir(dir)
    }
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("now_ms", &self.now_ms)
            .field("timers", &self.timers.len())
            .field("handlers", &self.handlers.len())
            .field("open_handles", &self.open_handles.len())
            .field("modules_cached", &self.module_cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::RuntimeConfig;
    use crate::runtime::driver::{ScriptRuntime, ScriptSource};
    use crate::runtime::selector::LabSelector;
    use crate::sandbox::Sandbox;
    use crate::test_utils::{init_test_logging, TestProcess, TestRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn runtime_with(registry: TestRegistry) -> ScriptRuntime {
        ScriptRuntime::with_selector(
            ScriptSource::Repl { force: false },
            Vec::new(),
            Box::new(TestProcess::new()),
            Arc::new(registry),
            Sandbox::new(),
            RuntimeConfig::default(),
            Arc::new(LabSelector::new()),
        )
        .expect("runtime construction failed")
    }

    #[test]
    fn require_initializes_and_caches_module_exports() {
        init_test("require_initializes_and_caches_module_exports");
        let registry = TestRegistry::new();
        let inits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&inits);
        registry.add_module("util", move |_: &mut RuntimeState| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(ScriptValue::string("util-exports"))
        });

        let mut runtime = runtime_with(registry);
        let state = runtime.state();

        crate::test_section!("first load");
        let first = state.require("util").expect("first require");
        crate::assert_with_log!(
            first.as_str() == Some("util-exports"),
            "factory exports are returned",
            Some("util-exports"),
            first.as_str()
        );

        crate::test_section!("cache hit");
        let second = state.require("util").expect("second require");
        crate::assert_with_log!(
            second == first,
            "cached exports are returned",
            &first,
            &second
        );
        crate::assert_with_log!(
            inits.load(Ordering::Relaxed) == 1,
            "factory ran exactly once",
            1u32,
            inits.load(Ordering::Relaxed)
        );
        crate::test_complete!("require_initializes_and_caches_module_exports");
    }

    #[test]
    fn require_raises_for_an_unknown_module() {
        init_test("require_raises_for_an_unknown_module");
        let mut runtime = runtime_with(TestRegistry::new());
        match runtime.state().require("no-such-module") {
            Err(ScriptError::Js(e)) => {
                crate::assert_with_log!(
                    e.message.contains("Cannot find module"),
                    "raise names the missing module",
                    "Cannot find module 'no-such-module'",
                    &e.message
                );
            }
            other => panic!("expected a script raise, got {other:?}"),
        }
        crate::test_complete!("require_raises_for_an_unknown_module");
    }

    #[test]
    fn require_propagates_factory_failures() {
        init_test("require_propagates_factory_failures");
        let registry = TestRegistry::new();
        registry.add_module("broken", |_: &mut RuntimeState| Err(ScriptError::js("init failed")));

        let mut runtime = runtime_with(registry);
        let state = runtime.state();
        assert!(state.require("broken").is_err());
        // A failed factory leaves nothing cached; the next load retries it.
        assert!(state.require("broken").is_err());
        crate::test_complete!("require_propagates_factory_failures");
    }

    #[test]
    fn require_internal_initializes_and_caches() {
        init_test("require_internal_initializes_and_caches");
        let registry = TestRegistry::new();
        let inits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&inits);
        registry.add_internal_module("natives", move |_: &mut RuntimeState| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(ScriptValue::string("natives-exports"))
        });

        let mut runtime = runtime_with(registry);
        let state = runtime.state();
        let first = state.require_internal("natives").expect("first binding");
        let second = state.require_internal("natives").expect("second binding");
        crate::assert_with_log!(
            second == first,
            "cached internal exports are returned",
            &first,
            &second
        );
        crate::assert_with_log!(
            inits.load(Ordering::Relaxed) == 1,
            "internal factory ran exactly once",
            1u32,
            inits.load(Ordering::Relaxed)
        );
        // The internal cache is separate from the public one.
        assert!(state.require("natives").is_err());
        crate::test_complete!("require_internal_initializes_and_caches");
    }

    #[test]
    fn require_internal_raises_for_an_unknown_module() {
        init_test("require_internal_raises_for_an_unknown_module");
        let mut runtime = runtime_with(TestRegistry::new());
        match runtime.state().require_internal("no-such-binding") {
            Err(ScriptError::Js(e)) => {
                crate::assert_with_log!(
                    e.message.contains("No such internal module"),
                    "raise names the missing binding",
                    "No such internal module 'no-such-binding'",
                    &e.message
                );
            }
            other => panic!("expected a script raise, got {other:?}"),
        }
        crate::test_complete!("require_internal_raises_for_an_unknown_module");
    }

    #[test]
    fn missing_internal_module_is_tolerated_by_the_lenient_lookup() {
        init_test("missing_internal_module_is_tolerated_by_the_lenient_lookup");
        // The shutdown window asks for modules that may never have existed;
        // the lenient lookup reports absence without raising.
        let mut runtime = runtime_with(TestRegistry::new());
        let resolved = runtime
            .state()
            .try_require_internal("fs")
            .expect("lenient lookup must not raise");
        crate::assert_with_log!(
            resolved.is_none(),
            "unknown internal module resolves to nothing",
            None::<ScriptValue>,
            resolved
        );
        crate::test_complete!("missing_internal_module_is_tolerated_by_the_lenient_lookup");
    }

    #[test]
    fn lenient_lookup_still_initializes_and_caches_known_modules() {
        init_test("lenient_lookup_still_initializes_and_caches_known_modules");
        let registry = TestRegistry::new();
        let inits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&inits);
        registry.add_internal_module("fs", move |_: &mut RuntimeState| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(ScriptValue::string("fs-exports"))
        });

        let mut runtime = runtime_with(registry);
        let state = runtime.state();
        let first = state
            .try_require_internal("fs")
            .expect("lenient lookup")
            .expect("module is known");
        let second = state
            .try_require_internal("fs")
            .expect("lenient lookup")
            .expect("module is cached");
        crate::assert_with_log!(
            second == first,
            "lenient lookup serves the cache",
            &first,
            &second
        );
        crate::assert_with_log!(
            inits.load(Ordering::Relaxed) == 1,
            "factory ran exactly once",
            1u32,
            inits.load(Ordering::Relaxed)
        );
        crate::test_complete!("lenient_lookup_still_initializes_and_caches_known_modules");
    }
}

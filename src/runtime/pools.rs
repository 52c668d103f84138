//! Worker pools backing blocking operations.
//!
//! Two pools with deliberately different policies:
//!
//! - [`AsyncPool`]: bounded worker count and a bounded queue, for operations
//!   that block but finish promptly (filesystem, DNS, some TLS). When both
//!   are full the submitting thread runs the task itself — throughput
//!   degrades, work is never dropped. Tasks that may block indefinitely must
//!   not use it.
//! - [`UnboundedPool`]: a cached pool with no maximum, for tasks that may
//!   never return (file pollers) and for hosting each script's loop thread.
//!   Idle threads retire after a timeout.

use crossbeam_queue::{ArrayQueue, SegQueue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How long an idle cached-pool thread sticks around before retiring.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct AsyncInner {
    max_threads: usize,
    active_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    queue: ArrayQueue<Job>,
    shutdown: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
    thread_name_prefix: String,
}

/// Bounded pool with a caller-runs rejection policy.
pub struct AsyncPool {
    inner: Arc<AsyncInner>,
}

/// Cloneable, shareable handle to an [`AsyncPool`].
#[derive(Clone)]
pub struct AsyncPoolHandle {
    inner: Arc<AsyncInner>,
}

impl AsyncPool {
    /// Creates a pool with at most `max_threads` workers and a queue of
    /// `queue_capacity` pending tasks.
    ///
    /// # Panics
    ///
    /// Panics when either bound is zero.
    #[must_use]
    pub fn new(max_threads: usize, queue_capacity: usize, thread_name_prefix: &str) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        assert!(queue_capacity > 0, "queue_capacity must be at least 1");
        Self {
            inner: Arc::new(AsyncInner {
                max_threads,
                active_threads: AtomicUsize::new(0),
                busy_threads: AtomicUsize::new(0),
                queue: ArrayQueue::new(queue_capacity),
                shutdown: AtomicBool::new(false),
                condvar: Condvar::new(),
                mutex: Mutex::new(()),
                thread_name_prefix: thread_name_prefix.to_string(),
            }),
        }
    }

    /// Returns a shareable handle.
    #[must_use]
    pub fn handle(&self) -> AsyncPoolHandle {
        AsyncPoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Submits a task; see [`AsyncPoolHandle::execute`].
    pub fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        execute_async(&self.inner, Box::new(f));
    }

    /// Number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stops accepting work and wakes parked workers so they can exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits up to `timeout` for workers to exit.
    ///
    /// Returns `true` when every worker exited in time.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            {
                let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
                self.inner.condvar.notify_all();
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl AsyncPoolHandle {
    /// Submits a task.
    ///
    /// If the queue is full and no worker can be added, the task runs on the
    /// calling thread before this returns. After shutdown the task is dropped
    /// with a warning.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        execute_async(&self.inner, Box::new(f));
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.len()
    }
}

impl std::fmt::Debug for AsyncPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPool")
            .field("max_threads", &self.inner.max_threads)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field("pending", &self.inner.queue.len())
            .finish()
    }
}

impl std::fmt::Debug for AsyncPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPoolHandle")
            .field("pending", &self.inner.queue.len())
            .finish()
    }
}

fn execute_async(inner: &Arc<AsyncInner>, job: Job) {
    if inner.shutdown.load(Ordering::Acquire) {
        warn!("async pool task submitted after shutdown; dropping");
        return;
    }

    match inner.queue.push(job) {
        Ok(()) => {
            maybe_spawn_async_worker(inner);
            let _guard = inner.mutex.lock().expect("pool mutex poisoned");
            inner.condvar.notify_one();
        }
        Err(job) => {
            // Queue full. Add a worker if the cap allows, then retry once;
            // otherwise the submitter pays.
            if inner.active_threads.load(Ordering::Relaxed) < inner.max_threads {
                spawn_async_worker(inner);
                if let Err(job) = inner.queue.push(job) {
                    run_on_caller(job);
                    return;
                }
                let _guard = inner.mutex.lock().expect("pool mutex poisoned");
                inner.condvar.notify_one();
            } else {
                run_on_caller(job);
            }
        }
    }
}

fn run_on_caller(job: Job) {
    debug!("async pool saturated; running task on submitter thread");
    job();
}

fn maybe_spawn_async_worker(inner: &Arc<AsyncInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    if active < inner.max_threads && busy >= active && !inner.queue.is_empty() {
        spawn_async_worker(inner);
    }
}

fn spawn_async_worker(inner: &Arc<AsyncInner>) {
    let id = inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-async-{}", inner.thread_name_prefix, id);
    let worker = Arc::clone(inner);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        async_worker_loop(&worker);
        worker.active_threads.fetch_sub(1, Ordering::Relaxed);
    });
    if spawned.is_err() {
        inner.active_threads.fetch_sub(1, Ordering::Relaxed);
        warn!("failed to spawn async pool worker");
    }
}

fn async_worker_loop(inner: &AsyncInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            job();
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        let guard = inner.mutex.lock().expect("pool mutex poisoned");
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        drop(
            inner
                .condvar
                .wait_timeout(guard, Duration::from_millis(200))
                .expect("pool mutex poisoned"),
        );
    }
}

struct UnboundedInner {
    queue: SegQueue<Job>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    next_thread_id: AtomicUsize,
    shutdown: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
    idle_timeout: Duration,
    thread_name_prefix: String,
}

/// Cached pool: every task gets a thread, idle threads are reused and retire
/// after [`IDLE_TIMEOUT`].
pub struct UnboundedPool {
    inner: Arc<UnboundedInner>,
}

/// Cloneable handle to an [`UnboundedPool`].
#[derive(Clone)]
pub struct UnboundedPoolHandle {
    inner: Arc<UnboundedInner>,
}

impl UnboundedPool {
    /// Creates an empty cached pool.
    #[must_use]
    pub fn new(thread_name_prefix: &str) -> Self {
        Self::with_idle_timeout(thread_name_prefix, IDLE_TIMEOUT)
    }

    /// Creates a cached pool with a custom idle retirement timeout.
    #[must_use]
    pub fn with_idle_timeout(thread_name_prefix: &str, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(UnboundedInner {
                queue: SegQueue::new(),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                next_thread_id: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                condvar: Condvar::new(),
                mutex: Mutex::new(()),
                idle_timeout,
                thread_name_prefix: thread_name_prefix.to_string(),
            }),
        }
    }

    /// Returns a shareable handle.
    #[must_use]
    pub fn handle(&self) -> UnboundedPoolHandle {
        UnboundedPoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Submits a task; see [`UnboundedPoolHandle::execute`].
    pub fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        execute_unbounded(&self.inner, Box::new(f));
    }

    /// Number of live threads, idle ones included.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Stops accepting work; running tasks are unaffected.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_all();
    }
}

impl UnboundedPoolHandle {
    /// Submits a task. Runs on an idle thread when one exists, otherwise on a
    /// freshly spawned one; never queues behind a busy thread.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        execute_unbounded(&self.inner, Box::new(f));
    }
}

impl std::fmt::Debug for UnboundedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnboundedPool")
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "idle_threads",
                &self.inner.idle_threads.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl std::fmt::Debug for UnboundedPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnboundedPoolHandle").finish_non_exhaustive()
    }
}

fn execute_unbounded(inner: &Arc<UnboundedInner>, job: Job) {
    if inner.shutdown.load(Ordering::Acquire) {
        warn!("unbounded pool task submitted after shutdown; dropping");
        return;
    }

    inner.queue.push(job);
    if inner.idle_threads.load(Ordering::Acquire) == 0 {
        spawn_unbounded_worker(inner);
    } else {
        let _guard = inner.mutex.lock().expect("pool mutex poisoned");
        inner.condvar.notify_one();
    }
}

fn spawn_unbounded_worker(inner: &Arc<UnboundedInner>) {
    inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-task-{}", inner.thread_name_prefix, id);
    let worker = Arc::clone(inner);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        unbounded_worker_loop(&worker);
        worker.active_threads.fetch_sub(1, Ordering::Relaxed);
    });
    if spawned.is_err() {
        inner.active_threads.fetch_sub(1, Ordering::Relaxed);
        warn!("failed to spawn unbounded pool worker");
    }
}

fn unbounded_worker_loop(inner: &UnboundedInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            job();
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        inner.idle_threads.fetch_add(1, Ordering::Release);
        let guard = inner.mutex.lock().expect("pool mutex poisoned");
        let (guard, result) = inner
            .condvar
            .wait_timeout(guard, inner.idle_timeout)
            .expect("pool mutex poisoned");
        drop(guard);
        inner.idle_threads.fetch_sub(1, Ordering::Release);

        if result.timed_out() && inner.queue.is_empty() {
            // Idle past the keep-alive window: retire.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Barrier;

    #[test]
    fn async_pool_runs_submitted_work() {
        let pool = AsyncPool::new(2, 8, "test");
        let counter = Arc::new(AtomicI32::new(0));
        for _ in 0..20 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn async_pool_saturation_runs_on_caller() {
        // One worker, one queue slot. Block the worker, fill the slot, and
        // the next submission must execute on this thread synchronously.
        let pool = AsyncPool::new(1, 1, "test");
        let release = Arc::new(Barrier::new(2));

        let r = Arc::clone(&release);
        pool.execute(move || {
            r.wait();
        });
        // Give the worker a moment to pick the blocker up.
        thread::sleep(Duration::from_millis(50));
        pool.execute(|| {});

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        pool.execute(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        });

        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
        release.wait();
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn async_pool_respects_thread_cap() {
        let pool = AsyncPool::new(2, 4, "test");
        let gate = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let g = Arc::clone(&gate);
            pool.execute(move || {
                g.wait();
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert!(pool.active_threads() <= 2);
        gate.wait();
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn async_pool_drops_after_shutdown() {
        let pool = AsyncPool::new(1, 1, "test");
        pool.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        pool.execute(move || r.store(true, Ordering::Relaxed));
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn unbounded_pool_never_queues_behind_busy_threads() {
        let pool = UnboundedPool::new("test");
        let gate = Arc::new(Barrier::new(5));
        let counter = Arc::new(AtomicI32::new(0));

        // Four tasks that all block until all four have started: only
        // possible if each got its own thread.
        for _ in 0..4 {
            let g = Arc::clone(&gate);
            let c = Arc::clone(&counter);
            pool.execute(move || {
                g.wait();
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        gate.wait();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        pool.shutdown();
    }

    #[test]
    fn unbounded_pool_reuses_idle_threads() {
        let pool = UnboundedPool::with_idle_timeout("test", Duration::from_secs(30));
        let done = Arc::new(Barrier::new(2));

        let d = Arc::clone(&done);
        pool.execute(move || {
            d.wait();
        });
        done.wait();
        thread::sleep(Duration::from_millis(50));
        let before = pool.active_threads();

        let done = Arc::new(Barrier::new(2));
        let d = Arc::clone(&done);
        pool.execute(move || {
            d.wait();
        });
        done.wait();
        thread::sleep(Duration::from_millis(50));
        assert!(pool.active_threads() <= before + 1);
        pool.shutdown();
    }

    #[test]
    fn unbounded_pool_idle_threads_retire() {
        let pool = UnboundedPool::with_idle_timeout("test", Duration::from_millis(40));
        let done = Arc::new(Barrier::new(2));
        let d = Arc::clone(&done);
        pool.execute(move || {
            d.wait();
        });
        done.wait();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.active_threads(), 0);
        pool.shutdown();
    }
}

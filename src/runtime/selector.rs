//! Non-blocking I/O readiness integration.
//!
//! The loop blocks in exactly one place: [`Selector::select`]. Modules attach
//! a [`SelectorHandler`] per readiness token; the loop invokes the handler
//! once per selected key and clears the key. [`Selector::wakeup`] is the
//! cross-thread unblock primitive — idempotent, callable from anywhere, and
//! the thing every producer-side enqueue must follow up with.
//!
//! Two implementations: [`PollSelector`] wraps the `polling` crate for
//! production, and [`LabSelector`] is a deterministic in-memory selector for
//! tests, fed by injected readiness events.

use crate::error::ScriptError;
use crate::runtime::state::RuntimeState;
use parking_lot::Mutex as PlMutex;
use polling::{Event as PollEvent, Poller};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Token identifying one registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Creates a token.
    #[must_use]
    pub const fn new(val: usize) -> Self {
        Self(val)
    }
}

/// Readiness flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No readiness.
    pub const NONE: Interest = Interest(0);
    /// Readable.
    pub const READABLE: Interest = Interest(0b01);
    /// Writable.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Both directions.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// True if readable is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// True if writable is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Union of two interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The registered source that became ready.
    pub token: Token,
    /// Which directions are ready.
    pub ready: Interest,
}

impl Event {
    /// Creates an event.
    #[must_use]
    pub const fn new(token: Token, ready: Interest) -> Self {
        Self { token, ready }
    }

    /// A readable event.
    #[must_use]
    pub const fn readable(token: Token) -> Self {
        Self::new(token, Interest::READABLE)
    }

    /// A writable event.
    #[must_use]
    pub const fn writable(token: Token) -> Self {
        Self::new(token, Interest::WRITABLE)
    }
}

/// Container for one select round's results.
#[derive(Debug, Default)]
pub struct Events {
    items: Vec<Event>,
}

impl Events {
    /// Creates an empty container.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Adds an event.
    pub fn push(&mut self, event: Event) {
        self.items.push(event);
    }

    /// Clears all events.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the selected events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An I/O object registrable with a selector.
pub trait Source {
    /// The raw OS descriptor, used for registration bookkeeping.
    fn raw_fd(&self) -> i32;
}

#[cfg(unix)]
impl<T: std::os::unix::io::AsRawFd> Source for T {
    fn raw_fd(&self) -> i32 {
        self.as_raw_fd()
    }
}

/// Handler invoked on the loop thread when its token is selected.
///
/// Handlers run inside the script-exception boundary; a raise here is offered
/// to the fatal handler like any other script error.
pub trait SelectorHandler: Send {
    /// Called once per select round in which the token was ready.
    fn selected(&mut self, event: Event, state: &mut RuntimeState) -> Result<(), ScriptError>;
}

impl<F> SelectorHandler for F
where
    F: FnMut(Event, &mut RuntimeState) -> Result<(), ScriptError> + Send,
{
    fn selected(&mut self, event: Event, state: &mut RuntimeState) -> Result<(), ScriptError> {
        self(event, state)
    }
}

/// OS readiness multiplexer behind the loop.
///
/// Opened at runtime construction and closed only when the runtime is
/// destroyed. All methods are callable concurrently; only the loop thread
/// calls [`select`](Self::select).
pub trait Selector: Send + Sync {
    /// Registers a source under a token.
    fn register(&self, source: &dyn Source, token: Token, interest: Interest) -> io::Result<()>;

    /// Removes a registration.
    fn deregister(&self, token: Token) -> io::Result<()>;

    /// Blocks for at most `timeout` (forever when `None`) and fills `events`
    /// with ready tokens. Returns the number of events. A pending or
    /// concurrent [`wakeup`](Self::wakeup) makes it return promptly with
    /// whatever is ready.
    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;

    /// Non-blocking variant of [`select`](Self::select).
    fn select_now(&self, events: &mut Events) -> io::Result<usize> {
        self.select(events, Some(Duration::ZERO))
    }

    /// Unblocks the next (or current) `select`. Idempotent, any thread.
    /// Errors are swallowed; a missed wakeup degrades to the poll backstop.
    fn wakeup(&self);
}

#[derive(Debug)]
struct RegistrationInfo {
    raw_fd: i32,
    interest: Interest,
}

/// Production selector on the `polling` crate.
///
/// `poll`/`notify` are fully functional. Source registration is bookkeeping
/// only: `Poller::add` is unsafe (the crate cannot prove the fd outlives the
/// registration) and this crate forbids unsafe code, so readiness for real
/// descriptors is not delivered here. Tests and readiness-driven modules use
/// [`LabSelector`]; the loop's blocking, wakeup, and timeout behavior is
/// identical across both.
pub struct PollSelector {
    poller: Poller,
    registrations: PlMutex<HashMap<Token, RegistrationInfo>>,
}

impl PollSelector {
    /// Creates a selector, opening the OS poller.
    ///
    /// # Errors
    ///
    /// Fails when the OS cannot allocate a poller (e.g. out of descriptors).
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: PlMutex::new(HashMap::new()),
        })
    }

    /// Number of bookkept registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    fn poll_event_to_interest(event: &PollEvent) -> Interest {
        let mut interest = Interest::NONE;
        if event.readable {
            interest = interest.add(Interest::READABLE);
        }
        if event.writable {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }
}

impl Selector for PollSelector {
    fn register(&self, source: &dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        if regs.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        regs.insert(
            token,
            RegistrationInfo {
                raw_fd: source.raw_fd(),
                interest,
            },
        );
        Ok(())
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let info = self
            .registrations
            .lock()
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        let _ = info.raw_fd;
        Ok(())
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let mut poll_events: Vec<PollEvent> = Vec::with_capacity(64);
        self.poller.wait(&mut poll_events, timeout)?;

        for poll_event in &poll_events {
            events.push(Event::new(
                Token(poll_event.key),
                Self::poll_event_to_interest(poll_event),
            ));
        }
        Ok(events.len())
    }

    fn wakeup(&self) {
        if let Err(e) = self.poller.notify() {
            debug!(error = %e, "selector wakeup failed");
        }
    }
}

impl std::fmt::Debug for PollSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSelector")
            .field("registration_count", &self.registration_count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct LabInner {
    ready: VecDeque<Event>,
    registered: HashMap<Token, Interest>,
    woken: bool,
}

/// Deterministic in-memory selector for tests.
///
/// Readiness is injected by test code rather than by the OS; `select` blocks
/// on a condvar until an event arrives, a wakeup lands, or the timeout
/// elapses, mirroring the production selector's contract against wall-clock
/// time.
#[derive(Debug, Default)]
pub struct LabSelector {
    inner: Mutex<LabInner>,
    condvar: Condvar,
}

impl LabSelector {
    /// Creates an empty lab selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a token ready; the next `select` returns it.
    pub fn inject(&self, event: Event) {
        let mut inner = self.inner.lock().expect("lab selector poisoned");
        inner.ready.push_back(event);
        self.condvar.notify_all();
    }

    /// Number of registered tokens.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.lock().expect("lab selector poisoned").registered.len()
    }
}

impl Selector for LabSelector {
    fn register(&self, _source: &dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("lab selector poisoned");
        if inner.registered.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        inner.registered.insert(token, interest);
        Ok(())
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("lab selector poisoned");
        inner
            .registered
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        inner.ready.retain(|e| e.token != token);
        Ok(())
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().expect("lab selector poisoned");

        loop {
            if !inner.ready.is_empty() {
                while let Some(event) = inner.ready.pop_front() {
                    events.push(event);
                }
                inner.woken = false;
                return Ok(events.len());
            }
            if inner.woken {
                inner.woken = false;
                return Ok(0);
            }
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(0);
                    }
                    let (guard, _timed_out) = self
                        .condvar
                        .wait_timeout(inner, remaining)
                        .expect("lab selector poisoned");
                    inner = guard;
                }
                None => {
                    inner = self.condvar.wait(inner).expect("lab selector poisoned");
                }
            }
        }
    }

    fn wakeup(&self) {
        let mut inner = self.inner.lock().expect("lab selector poisoned");
        inner.woken = true;
        self.condvar.notify_all();
    }
}

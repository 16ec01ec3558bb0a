use crate::common::{Current, Named};
use crate::config::Config;
use crate::error::{HubError, Result};
use crate::fiber::constants::{FiberState, WakeCause};
use crate::fiber::{Fiber, FiberId};
use crate::hub::listener::{FailurePolicy, FailureSink, Listener, LogSink};
use crate::net::external::ExternalLoop;
use crate::net::{Backend, BackendKind, Direction, Multiplexer};
use crate::wake::{RemoteHandle, WakeChannel, WakeRequest};
use corosensei::CoroutineResult;
use greenhub_timer::{TimerId, TimerList};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle listeners and the failure sink.
pub mod listener;

mod current;

mod primitives;

#[cfg(test)]
mod tests;

/// What a timer does when it fires.
pub(crate) enum TimerTarget {
    /// end a sleep
    Wake(FiberId),
    /// end an fd wait with `TimedOut`
    Timeout(FiberId),
    /// schedule a delayed spawn
    Start(FiberId),
    /// run a callback on the hub thread
    Call(Box<dyn FnOnce(&HubHandle)>),
}

impl Debug for TimerTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerTarget::Wake(id) => f.debug_tuple("Wake").field(id).finish(),
            TimerTarget::Timeout(id) => f.debug_tuple("Timeout").field(id).finish(),
            TimerTarget::Start(id) => f.debug_tuple("Start").field(id).finish(),
            TimerTarget::Call(_) => f.write_str("Call"),
        }
    }
}

/// The waiters of one fd, at most one per direction.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct Interest {
    read: Option<FiberId>,
    write: Option<FiberId>,
}

impl Interest {
    fn slot(&mut self, direction: Direction) -> &mut Option<FiberId> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn waiters(&self) -> impl Iterator<Item = (Direction, FiberId)> {
        [
            self.read.map(|id| (Direction::Read, id)),
            self.write.map(|id| (Direction::Write, id)),
        ]
        .into_iter()
        .flatten()
    }
}

pub(crate) struct HubInner {
    name: String,
    config: Config,
    kind: BackendKind,
    backend: RefCell<Backend>,
    wake: Arc<WakeChannel>,
    ready: RefCell<VecDeque<(FiberId, WakeCause)>>,
    fibers: RefCell<HashMap<FiberId, Rc<Fiber>>>,
    interests: RefCell<HashMap<RawFd, Interest>>,
    timers: RefCell<TimerList<TimerTarget>>,
    current: Cell<Option<FiberId>>,
    next_id: Cell<u64>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    closed: Cell<bool>,
    fatal: RefCell<Option<HubError>>,
    sink: RefCell<Rc<dyn FailureSink>>,
    listeners: RefCell<Vec<Rc<dyn Listener>>>,
}

impl Debug for HubInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("backend", &self.kind)
            .field("ready", &self.ready.borrow().len())
            .field("fibers", &self.fibers.borrow().len())
            .field("interests", &self.interests.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .field("current", &self.current.get())
            .field("running", &self.running.get())
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

/// A cheap, clonable, thread-affine handle to a hub.
///
/// Every primitive lives here; fibers receive one when they start. A handle that
/// outlives its [`Hub`] fails with [`HubError::HubGone`].
#[derive(Clone)]
pub struct HubHandle {
    inner: Rc<HubInner>,
}

impl Debug for HubHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Named for HubHandle {
    fn get_name(&self) -> &str {
        &self.inner.name
    }
}

/// The owner of a hub; dropping it tears the hub down.
pub struct Hub {
    handle: HubHandle,
}

impl Debug for Hub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.handle, f)
    }
}

impl Deref for Hub {
    type Target = HubHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.handle.teardown();
    }
}

impl Hub {
    /// Build a hub on the backend `config` resolves to.
    ///
    /// # Errors
    /// [`HubError::UnsupportedBackend`] if that backend is unavailable here, or an
    /// OS error while creating it.
    pub fn new(config: Config) -> Result<Self> {
        let kind = config.resolve_backend()?;
        let backend = Backend::new(kind, config.get_event_capacity())?;
        Self::with_backend(config, backend)
    }

    /// Build a hub running on top of a host event loop.
    ///
    /// # Errors
    /// if the wake channel can not be created or watched by the host.
    pub fn with_host_loop(config: Config, host: impl ExternalLoop + 'static) -> Result<Self> {
        Self::with_backend(config, Backend::with_host_loop(host))
    }

    fn with_backend(config: Config, mut backend: Backend) -> Result<Self> {
        let name = config
            .get_name()
            .map_or_else(|| format!("hub-{}", uuid::Uuid::new_v4()), String::from);
        let wake = Arc::new(WakeChannel::new()?);
        backend.register(wake.notifier().reader(), Direction::Read)?;
        let kind = backend.kind();
        crate::info!("{name} created on the {kind} backend");
        let inner = HubInner {
            name,
            config,
            kind,
            backend: RefCell::new(backend),
            wake,
            ready: RefCell::new(VecDeque::new()),
            fibers: RefCell::new(HashMap::new()),
            interests: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerList::default()),
            current: Cell::new(None),
            next_id: Cell::new(1),
            running: Cell::new(false),
            stopped: Cell::new(false),
            closed: Cell::new(false),
            fatal: RefCell::new(None),
            sink: RefCell::new(Rc::new(LogSink)),
            listeners: RefCell::new(Vec::new()),
        };
        Ok(Hub {
            handle: HubHandle {
                inner: Rc::new(inner),
            },
        })
    }

    /// Another handle to this hub.
    #[must_use]
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }
}

/// Resets the loop flags even if a listener panics.
struct Turn<'h>(&'h HubHandle);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        HubHandle::clean_current();
        self.0.inner.running.set(false);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("fiber failed without message"))
}

impl HubHandle {
    pub(crate) fn from_inner(inner: Rc<HubInner>) -> Self {
        HubHandle { inner }
    }

    /// The backend this hub was built with.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.kind
    }

    /// The config this hub was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// A `Send + Sync` handle to wake this hub from other threads.
    #[must_use]
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle::new(&self.inner.name, Arc::clone(&self.inner.wake))
    }

    /// The fiber running right now, if any.
    #[must_use]
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.current.get()
    }

    /// The state of a live fiber, `None` once it is dead.
    #[must_use]
    pub fn fiber_state(&self, fiber: FiberId) -> Option<FiberState> {
        self.lookup(fiber).map(|fiber| fiber.state.get())
    }

    /// How many fibers are not dead yet.
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    /// Returns `true` when there is nothing left to do: no live fibers, no timers, no
    /// fd waiters and no pending wakes.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.fibers.borrow().is_empty()
            && self.inner.ready.borrow().is_empty()
            && self.inner.timers.borrow().is_empty()
            && self.inner.interests.borrow().is_empty()
            && self.inner.wake.is_empty()
    }

    /// Returns `true` once the owning [`Hub`] was dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Replace the sink receiving unjoined failures, [`LogSink`] by default.
    pub fn set_failure_sink(&self, sink: impl FailureSink + 'static) {
        *self.inner.sink.borrow_mut() = Rc::new(sink);
    }

    /// Add a lifecycle listener.
    pub fn add_listener(&self, listener: impl Listener + 'static) {
        self.inner.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Make [`HubHandle::run`] return after the current iteration.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    /// Run the loop until the hub is idle or stopped.
    ///
    /// # Errors
    /// [`HubError::Unhandled`] if the failure sink aborted, [`HubError::AlreadyRunning`]
    /// if called from inside the loop, or a backend error.
    pub fn run(&self) -> Result<()> {
        self.check_open()?;
        if self.inner.running.get() {
            return Err(HubError::AlreadyRunning(self.inner.name.clone()));
        }
        if let Some(fatal) = self.inner.fatal.take() {
            return Err(fatal);
        }
        self.inner.stopped.set(false);
        while !self.inner.stopped.get() && !self.is_idle() {
            self.run_once()?;
        }
        match self.inner.fatal.take() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    /// Run one iteration of the loop: drain remote wakes, resume the fibers ready now,
    /// wait for readiness, then fire expired timers.
    ///
    /// # Errors
    /// [`HubError::AlreadyRunning`] if called from inside the loop, or a backend error.
    pub fn run_once(&self) -> Result<()> {
        self.check_open()?;
        if self.inner.running.replace(true) {
            return Err(HubError::AlreadyRunning(self.inner.name.clone()));
        }
        HubHandle::init_current(self);
        let _turn = Turn(self);
        self.turn()
    }

    fn turn(&self) -> Result<()> {
        while let Some(request) = self.inner.wake.pop() {
            self.handle_request(request);
        }

        let batch = self.inner.ready.borrow().len();
        for _ in 0..batch {
            let next = self.inner.ready.borrow_mut().pop_front();
            let Some((id, cause)) = next else {
                break;
            };
            let Some(fiber) = self.lookup(id) else {
                continue;
            };
            if fiber.state.get() != FiberState::Runnable {
                continue;
            }
            if fiber.cancel.get() && !fiber.started.get() {
                fiber.cancel.set(false);
                self.finish(&fiber, Err(HubError::Cancelled));
                continue;
            }
            self.switch_to(&fiber, cause);
        }

        let timeout = self.poll_timeout();
        let events = self.inner.backend.borrow_mut().wait(timeout)?;
        for (fd, direction) in events {
            self.dispatch(fd, direction);
        }

        self.fire_timers();
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.inner.ready.borrow().is_empty()
            || !self.inner.wake.is_empty()
            || self.inner.stopped.get()
            || self.is_idle()
        {
            return Some(Duration::ZERO);
        }
        let ceiling = self.inner.config.get_poll_ceiling();
        match self.inner.timers.borrow().next_deadline() {
            Some(deadline) => {
                let left = Duration::from_nanos(deadline.saturating_sub(greenhub_timer::now()));
                Some(ceiling.map_or(left, |ceiling| ceiling.min(left)))
            }
            None => ceiling,
        }
    }

    fn handle_request(&self, request: WakeRequest) {
        match request {
            WakeRequest::Unpark(fiber) => self.unpark(fiber),
            WakeRequest::Call(callback) => {
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
                {
                    let error = HubError::Panicked(panic_message(payload.as_ref()));
                    self.report_failure("remote call", &error);
                }
            }
            WakeRequest::Stop => self.stop(),
        }
    }

    fn dispatch(&self, fd: RawFd, direction: Direction) {
        let notifier = self.inner.wake.notifier();
        if fd == notifier.reader() {
            notifier.drain();
            return;
        }
        let waiter = self.take_waiter(fd, direction);
        self.unregister(fd, direction);
        let Some(fiber) = waiter.and_then(|id| self.lookup(id)) else {
            return;
        };
        fiber.waiting.set(None);
        self.clear_timer(&fiber);
        self.schedule(&fiber, WakeCause::Io(fd, direction));
    }

    fn fire_timers(&self) {
        let now = greenhub_timer::now();
        let before = self.inner.timers.borrow().next_sequence();
        loop {
            let next = self.inner.timers.borrow_mut().pop_expired(now, before);
            let Some((timer, target)) = next else {
                break;
            };
            self.fire(timer, target);
        }
    }

    fn fire(&self, timer: TimerId, target: TimerTarget) {
        match target {
            TimerTarget::Wake(id) => {
                if let Some(fiber) = self.owned_by(id, timer, FiberState::SuspendedTimer) {
                    self.schedule(&fiber, WakeCause::Timer);
                }
            }
            TimerTarget::Timeout(id) => {
                if let Some(fiber) = self.owned_by(id, timer, FiberState::SuspendedIo) {
                    if let Some((fd, direction)) = fiber.waiting.take() {
                        self.forget_interest(fd, direction, id);
                    }
                    self.schedule(&fiber, WakeCause::TimedOut);
                }
            }
            TimerTarget::Start(id) => {
                if let Some(fiber) = self.owned_by(id, timer, FiberState::New) {
                    self.schedule(&fiber, WakeCause::Spawned);
                }
            }
            TimerTarget::Call(callback) => {
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
                {
                    let error = HubError::Panicked(panic_message(payload.as_ref()));
                    self.report_failure(&timer.to_string(), &error);
                }
            }
        }
    }

    /// The fiber `id` if `timer` is still its pending timer and it is in `state`.
    fn owned_by(&self, id: FiberId, timer: TimerId, state: FiberState) -> Option<Rc<Fiber>> {
        let fiber = self.lookup(id)?;
        if fiber.timer.get() != Some(timer) || fiber.state.get() != state {
            return None;
        }
        fiber.timer.set(None);
        Some(fiber)
    }

    /// Transfer control to `fiber` until it suspends again or dies.
    pub(crate) fn switch_to(&self, fiber: &Rc<Fiber>, cause: WakeCause) {
        let Some(mut coroutine) = fiber.coroutine.take() else {
            crate::warn!("{} has nothing to resume", fiber.get_name());
            return;
        };
        fiber.started.set(true);
        fiber.state.set(FiberState::Running);
        fiber.cause.set(Some(cause));
        self.each_listener(|listener| listener.on_resume(fiber.id, fiber.get_name(), cause));
        let previous = self.inner.current.replace(Some(fiber.id));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(cause)));
        self.inner.current.set(previous);
        match result {
            Ok(CoroutineResult::Yield(())) => {
                fiber.coroutine.set(Some(coroutine));
                let state = fiber.state.get();
                self.each_listener(|listener| {
                    listener.on_suspend(fiber.id, fiber.get_name(), state);
                });
            }
            Ok(CoroutineResult::Return(outcome)) => {
                drop(coroutine);
                self.finish(fiber, outcome);
            }
            Err(payload) => {
                drop(coroutine);
                let message = panic_message(payload.as_ref());
                self.finish(fiber, Err(HubError::Panicked(message)));
            }
        }
    }

    /// Mark `fiber` dead, wake its joiners and store or report its failure.
    pub(crate) fn finish(&self, fiber: &Rc<Fiber>, outcome: Result<()>) {
        fiber.state.set(FiberState::Dead);
        fiber.suspender.set(None);
        drop(fiber.coroutine.take());
        _ = self.inner.fibers.borrow_mut().remove(&fiber.id);
        self.clear_timer(fiber);
        if let Some((fd, direction)) = fiber.waiting.take() {
            self.forget_interest(fd, direction, fiber.id);
        }
        let failure = outcome.err();
        match &failure {
            Some(failure) => {
                crate::debug!("{} failed: {failure}", fiber.get_name());
            }
            None => {
                crate::debug!("{} finished", fiber.get_name());
            }
        }
        self.each_listener(|listener| {
            listener.on_dead(fiber.id, fiber.get_name(), failure.as_ref());
        });
        let joiners = std::mem::take(&mut *fiber.joiners.borrow_mut());
        for joiner in &joiners {
            if let Some(joiner) = self.lookup(*joiner) {
                if joiner.state.get() == FiberState::SuspendedJoin {
                    joiner.joining.set(None);
                    self.schedule(&joiner, WakeCause::Joined(fiber.id));
                }
            }
        }
        if let Some(failure) = failure {
            if fiber.detached.get() && joiners.is_empty() {
                self.report_failure(fiber.get_name(), &failure);
            } else {
                *fiber.failure.borrow_mut() = Some(failure);
            }
        }
    }

    /// Append `fiber` to the ready queue.
    pub(crate) fn schedule(&self, fiber: &Fiber, cause: WakeCause) {
        fiber.state.set(FiberState::Runnable);
        self.inner.ready.borrow_mut().push_back((fiber.id, cause));
    }

    pub(crate) fn lookup(&self, id: FiberId) -> Option<Rc<Fiber>> {
        self.inner.fibers.borrow().get(&id).cloned()
    }

    /// Hand an unjoined failure to the sink; cancellations are dropped silently.
    pub(crate) fn report_failure(&self, origin: &str, error: &HubError) {
        if error.is_cancelled() {
            return;
        }
        let sink = self.inner.sink.borrow().clone();
        if sink.on_failure(origin, error) == FailurePolicy::Abort {
            crate::error!("{} aborts on the failure of {origin}: {error}", self.inner.name);
            let mut fatal = self.inner.fatal.borrow_mut();
            if fatal.is_none() {
                *fatal = Some(HubError::Unhandled {
                    origin: origin.to_string(),
                    message: error.to_string(),
                });
            }
            self.inner.stopped.set(true);
        }
    }

    fn each_listener(&self, f: impl Fn(&dyn Listener)) {
        if self.inner.listeners.borrow().is_empty() {
            return;
        }
        let listeners = self.inner.listeners.borrow().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(HubError::HubGone);
        }
        Ok(())
    }

    pub(crate) fn clear_timer(&self, fiber: &Fiber) {
        if let Some(timer) = fiber.timer.take() {
            _ = self.inner.timers.borrow_mut().cancel(&timer);
        }
    }

    fn take_waiter(&self, fd: RawFd, direction: Direction) -> Option<FiberId> {
        let mut interests = self.inner.interests.borrow_mut();
        let interest = interests.get_mut(&fd)?;
        let waiter = interest.slot(direction).take();
        if interest.is_empty() {
            _ = interests.remove(&fd);
        }
        waiter
    }

    fn unregister(&self, fd: RawFd, direction: Direction) {
        if let Err(e) = self.inner.backend.borrow_mut().unregister(fd, direction) {
            crate::warn!("{} failed to unregister {fd} for {direction}: {e}", self.inner.name);
        }
    }

    /// Drop the registration of `(fd, direction)` if `fiber` still owns it.
    pub(crate) fn forget_interest(&self, fd: RawFd, direction: Direction, fiber: FiberId) {
        let owned = self
            .inner
            .interests
            .borrow()
            .get(&fd)
            .and_then(|interest| match direction {
                Direction::Read => interest.read,
                Direction::Write => interest.write,
            })
            == Some(fiber);
        if owned {
            _ = self.take_waiter(fd, direction);
            self.unregister(fd, direction);
        }
    }

    fn teardown(&self) {
        let inner = &self.inner;
        if inner.closed.replace(true) {
            return;
        }
        inner.wake.close();
        inner.ready.borrow_mut().clear();
        let live: Vec<Rc<Fiber>> = inner.fibers.borrow_mut().drain().map(|(_, f)| f).collect();
        if !live.is_empty() {
            crate::warn!("{} dropped with {} live fibers", inner.name, live.len());
        }
        for fiber in &live {
            fiber.state.set(FiberState::Dead);
            fiber.suspender.set(None);
            _ = fiber.timer.take();
            _ = fiber.waiting.take();
            if fiber.failure.borrow().is_none() {
                *fiber.failure.borrow_mut() = Some(HubError::Cancelled);
            }
            // unwinds a suspended stack, running its drop guards
            drop(fiber.coroutine.take());
        }
        let timers = std::mem::take(&mut *inner.timers.borrow_mut());
        drop(timers);
        let interests: Vec<(RawFd, Interest)> = inner.interests.borrow_mut().drain().collect();
        let mut backend = inner.backend.borrow_mut();
        for (fd, interest) in interests {
            for (direction, _) in interest.waiters() {
                _ = backend.unregister(fd, direction);
            }
        }
        _ = backend.unregister(inner.wake.notifier().reader(), Direction::Read);
        crate::info!("{} closed", inner.name);
    }
}

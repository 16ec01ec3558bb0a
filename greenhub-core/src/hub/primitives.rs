use crate::common::Named;
use crate::error::{HubError, Result};
use crate::fiber::constants::{FiberState, WakeCause};
use crate::fiber::suspender;
use crate::fiber::{Fiber, FiberHandle, FiberId};
use crate::hub::{HubHandle, TimerTarget};
use crate::net::{Direction, Multiplexer};
use greenhub_timer::{get_timeout_time, TimerId};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

impl HubHandle {
    /// Create a fiber running `f` and queue it; it starts on a later loop iteration,
    /// never inline.
    ///
    /// # Errors
    /// if the fiber stack can not be allocated or the hub is gone.
    pub fn spawn<T, F>(&self, f: F) -> Result<FiberHandle<T>>
    where
        T: 'static,
        F: FnOnce(&HubHandle) -> Result<T> + 'static,
    {
        self.spawn_fiber(None, None, f)
    }

    /// Like [`HubHandle::spawn`] with a custom fiber name.
    ///
    /// # Errors
    /// if the fiber stack can not be allocated or the hub is gone.
    pub fn spawn_named<T, F>(&self, name: impl Into<String>, f: F) -> Result<FiberHandle<T>>
    where
        T: 'static,
        F: FnOnce(&HubHandle) -> Result<T> + 'static,
    {
        self.spawn_fiber(Some(name.into()), None, f)
    }

    /// Like [`HubHandle::spawn`], but the fiber is only queued once `delay` elapsed.
    ///
    /// # Errors
    /// if the fiber stack can not be allocated or the hub is gone.
    pub fn spawn_after<T, F>(&self, delay: Duration, f: F) -> Result<FiberHandle<T>>
    where
        T: 'static,
        F: FnOnce(&HubHandle) -> Result<T> + 'static,
    {
        self.spawn_fiber(None, Some(delay), f)
    }

    fn spawn_fiber<T, F>(
        &self,
        name: Option<String>,
        delay: Option<Duration>,
        f: F,
    ) -> Result<FiberHandle<T>>
    where
        T: 'static,
        F: FnOnce(&HubHandle) -> Result<T> + 'static,
    {
        self.check_open()?;
        let id = FiberId::new(self.inner.next_id.get());
        self.inner.next_id.set(self.inner.next_id.get() + 1);
        let name = name.unwrap_or_else(|| format!("{}|{}", self.inner.name, uuid::Uuid::new_v4()));
        let fiber = Rc::new(Fiber::new(id, name, self.inner.current.get()));
        let slot = Rc::new(RefCell::new(None));

        let hub = Rc::downgrade(&self.inner);
        let record = Rc::downgrade(&fiber);
        let result = Rc::clone(&slot);
        let coroutine = suspender::create(
            self.inner.config.get_stack_size(),
            move |suspender, _| {
                if let Some(fiber) = record.upgrade() {
                    fiber.suspender.set(Some(suspender));
                }
                let hub = hub
                    .upgrade()
                    .map(HubHandle::from_inner)
                    .ok_or(HubError::HubGone)?;
                let value = f(&hub)?;
                *result.borrow_mut() = Some(value);
                Ok(())
            },
        )?;
        fiber.coroutine.set(Some(coroutine));
        _ = self
            .inner
            .fibers
            .borrow_mut()
            .insert(id, Rc::clone(&fiber));
        match delay {
            Some(delay) => {
                let timer = self
                    .inner
                    .timers
                    .borrow_mut()
                    .insert(get_timeout_time(delay), TimerTarget::Start(id));
                fiber.timer.set(Some(timer));
            }
            None => self.schedule(&fiber, WakeCause::Spawned),
        }
        crate::debug!("{} spawned {}", self.inner.name, fiber.get_name());
        self.each_listener(|listener| listener.on_spawn(id, fiber.get_name()));
        Ok(FiberHandle::new(fiber, slot, Rc::downgrade(&self.inner)))
    }

    fn current_record(&self) -> Result<Rc<Fiber>> {
        self.inner
            .current
            .get()
            .and_then(|id| self.lookup(id))
            .ok_or(HubError::NotInFiber)
    }

    fn suspend_current(&self, fiber: &Fiber, state: FiberState) -> WakeCause {
        fiber.state.set(state);
        match fiber.suspender.get() {
            Some(suspender) => suspender.suspend(),
            None => WakeCause::Cancelled,
        }
    }

    /// Let every other ready fiber run before continuing.
    ///
    /// # Errors
    /// [`HubError::NotInFiber`] outside a fiber, [`HubError::Cancelled`] if killed.
    pub fn yield_now(&self) -> Result<()> {
        let fiber = self.current_record()?;
        fiber.check_cancel()?;
        self.schedule(&fiber, WakeCause::Yielded);
        _ = self.suspend_current(&fiber, FiberState::Runnable);
        fiber.check_cancel()
    }

    /// Suspend the current fiber for `duration`. Outside any fiber this drives the loop
    /// until the deadline passed.
    ///
    /// # Errors
    /// [`HubError::Cancelled`] if killed while asleep.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check_open()?;
        let deadline = get_timeout_time(duration);
        if self.inner.current.get().is_none() {
            return self.drive_until(deadline);
        }
        let fiber = self.current_record()?;
        fiber.check_cancel()?;
        let timer = self
            .inner
            .timers
            .borrow_mut()
            .insert(deadline, TimerTarget::Wake(fiber.id));
        fiber.timer.set(Some(timer));
        _ = self.suspend_current(&fiber, FiberState::SuspendedTimer);
        self.clear_timer(&fiber);
        fiber.check_cancel()
    }

    fn drive_until(&self, deadline: u64) -> Result<()> {
        // keeps the loop from blocking past the deadline
        let timer = self
            .inner
            .timers
            .borrow_mut()
            .insert(deadline, TimerTarget::Call(Box::new(|_| {})));
        let mut result = Ok(());
        while greenhub_timer::now() < deadline {
            result = self.run_once();
            if result.is_err() {
                break;
            }
        }
        _ = self.inner.timers.borrow_mut().cancel(&timer);
        result
    }

    /// Suspend the current fiber until `fd` is readable.
    ///
    /// # Errors
    /// [`HubError::AlreadyWaiting`] if another fiber waits to read `fd`,
    /// [`HubError::Closed`] if the fd was aborted, [`HubError::Cancelled`] if killed,
    /// [`HubError::NotInFiber`] outside a fiber, or a backend error.
    pub fn wait_read(&self, fd: RawFd) -> Result<()> {
        self.wait_io(fd, Direction::Read, None)
    }

    /// Suspend the current fiber until `fd` is writable, see [`HubHandle::wait_read`].
    ///
    /// # Errors
    /// like [`HubHandle::wait_read`].
    pub fn wait_write(&self, fd: RawFd) -> Result<()> {
        self.wait_io(fd, Direction::Write, None)
    }

    /// [`HubHandle::wait_read`] giving up after `timeout`.
    ///
    /// # Errors
    /// [`HubError::TimedOut`] once `timeout` elapsed, else like [`HubHandle::wait_read`].
    pub fn wait_read_timeout(&self, fd: RawFd, timeout: Duration) -> Result<()> {
        self.wait_io(fd, Direction::Read, Some(timeout))
    }

    /// [`HubHandle::wait_write`] giving up after `timeout`.
    ///
    /// # Errors
    /// [`HubError::TimedOut`] once `timeout` elapsed, else like [`HubHandle::wait_read`].
    pub fn wait_write_timeout(&self, fd: RawFd, timeout: Duration) -> Result<()> {
        self.wait_io(fd, Direction::Write, Some(timeout))
    }

    fn wait_io(&self, fd: RawFd, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        let fiber = self.current_record()?;
        fiber.check_cancel()?;
        let held = self
            .inner
            .interests
            .borrow_mut()
            .get_mut(&fd)
            .is_some_and(|interest| interest.slot(direction).is_some());
        if held {
            return Err(HubError::AlreadyWaiting { fd, direction });
        }
        self.inner.backend.borrow_mut().register(fd, direction)?;
        *self
            .inner
            .interests
            .borrow_mut()
            .entry(fd)
            .or_default()
            .slot(direction) = Some(fiber.id);
        fiber.waiting.set(Some((fd, direction)));
        if let Some(timeout) = timeout {
            let timer = self
                .inner
                .timers
                .borrow_mut()
                .insert(get_timeout_time(timeout), TimerTarget::Timeout(fiber.id));
            fiber.timer.set(Some(timer));
        }

        let cause = self.suspend_current(&fiber, FiberState::SuspendedIo);

        if let Some((fd, direction)) = fiber.waiting.take() {
            self.forget_interest(fd, direction, fiber.id);
        }
        self.clear_timer(&fiber);
        fiber.check_cancel()?;
        match cause {
            WakeCause::Closed(fd) => Err(HubError::Closed(fd)),
            WakeCause::TimedOut => Err(HubError::TimedOut),
            WakeCause::Cancelled => Err(HubError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Suspend the current fiber until [`HubHandle::unpark`]ed, returning at once if a
    /// permit is pending.
    ///
    /// # Errors
    /// [`HubError::NotInFiber`] outside a fiber, [`HubError::Cancelled`] if killed.
    pub fn park(&self) -> Result<()> {
        let fiber = self.current_record()?;
        fiber.check_cancel()?;
        if fiber.permit.replace(false) {
            return Ok(());
        }
        _ = self.suspend_current(&fiber, FiberState::SuspendedPark);
        fiber.check_cancel()
    }

    /// Wake a parked fiber, or leave it a permit for its next [`HubHandle::park`].
    pub fn unpark(&self, fiber: FiberId) {
        let Some(target) = self.lookup(fiber) else {
            return;
        };
        if target.state.get() == FiberState::SuspendedPark {
            self.schedule(&target, WakeCause::Unparked);
        } else {
            target.permit.set(true);
        }
    }

    /// Cancel `fiber` cooperatively: it sees [`HubError::Cancelled`] at its next resume
    /// point. A suspended fiber is detached from what it waits on and made runnable; a
    /// fiber that never ran dies without running. Dead fibers are left alone.
    pub fn kill(&self, fiber: FiberId) {
        let Some(target) = self.lookup(fiber) else {
            return;
        };
        target.cancel.set(true);
        match target.state.get() {
            FiberState::New => {
                target.cancel.set(false);
                self.finish(&target, Err(HubError::Cancelled));
            }
            FiberState::Runnable | FiberState::Running | FiberState::Dead => {}
            FiberState::SuspendedIo => {
                if let Some((fd, direction)) = target.waiting.take() {
                    self.forget_interest(fd, direction, fiber);
                }
                self.clear_timer(&target);
                self.schedule(&target, WakeCause::Cancelled);
            }
            FiberState::SuspendedTimer | FiberState::SuspendedPark => {
                self.clear_timer(&target);
                self.schedule(&target, WakeCause::Cancelled);
            }
            FiberState::SuspendedJoin => {
                if let Some(joined) = target.joining.take().and_then(|id| self.lookup(id)) {
                    joined.joiners.borrow_mut().retain(|id| *id != fiber);
                }
                self.schedule(&target, WakeCause::Cancelled);
            }
        }
    }

    pub(crate) fn join_fiber(&self, target: &Rc<Fiber>) -> Result<()> {
        if target.is_dead() {
            return Ok(());
        }
        let Some(me) = self.inner.current.get() else {
            while !target.is_dead() {
                self.run_once()?;
            }
            return Ok(());
        };
        if me == target.id {
            return Err(HubError::WouldDeadlock);
        }
        let fiber = self.current_record()?;
        fiber.check_cancel()?;
        target.joiners.borrow_mut().push(me);
        fiber.joining.set(Some(target.id));
        _ = self.suspend_current(&fiber, FiberState::SuspendedJoin);
        fiber.joining.set(None);
        fiber.check_cancel()
    }

    /// Wake every fiber waiting on `fd` with [`HubError::Closed`], e.g. before closing
    /// it. Returns how many fibers were woken.
    pub fn abort_waiters(&self, fd: RawFd) -> usize {
        let interest = self.inner.interests.borrow_mut().remove(&fd);
        let Some(interest) = interest else {
            return 0;
        };
        let mut woken = 0;
        for (direction, id) in interest.waiters() {
            self.unregister(fd, direction);
            if let Some(fiber) = self.lookup(id) {
                fiber.waiting.set(None);
                self.clear_timer(&fiber);
                self.schedule(&fiber, WakeCause::Closed(fd));
                woken += 1;
            }
        }
        woken
    }

    /// Run `callback` on the hub thread once `delay` elapsed, outside any fiber.
    ///
    /// # Errors
    /// if the hub is gone.
    pub fn schedule_call(
        &self,
        delay: Duration,
        callback: impl FnOnce(&HubHandle) + 'static,
    ) -> Result<TimerId> {
        self.check_open()?;
        Ok(self
            .inner
            .timers
            .borrow_mut()
            .insert(get_timeout_time(delay), TimerTarget::Call(Box::new(callback))))
    }

    /// Cancel a pending [`HubHandle::schedule_call`]; returns `false` if it already fired
    /// or was cancelled.
    pub fn cancel_timer(&self, timer: TimerId) -> bool {
        let target = self.inner.timers.borrow_mut().cancel(&timer);
        target.is_some()
    }
}

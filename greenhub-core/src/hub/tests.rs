use super::*;
use crate::fiber::FiberHandle;
use crate::hub::listener::FailurePolicy;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().expect("create socket pair failed");
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

fn config(name: &str) -> Config {
    let mut config = Config::default();
    _ = config.set_name(name);
    config
}

/// One hub per OS backend, plus the external adapter when available.
fn hubs() -> Vec<Hub> {
    hubs_with(|_| {})
}

fn hubs_with(configure: impl Fn(&mut Config)) -> Vec<Hub> {
    let mut hubs: Vec<Hub> = BackendKind::available()
        .into_iter()
        .map(|kind| {
            let mut config = config(&format!("test-{kind}"));
            _ = config.set_backend(kind);
            configure(&mut config);
            Hub::new(config).unwrap()
        })
        .collect();
    #[cfg(feature = "host-loop")]
    {
        let mut config = config("test-external");
        configure(&mut config);
        hubs.push(
            Hub::with_host_loop(config, crate::net::host::PollingHostLoop::new().unwrap())
                .unwrap(),
        );
    }
    hubs
}

#[derive(Debug)]
struct Guard(Rc<Cell<bool>>);

impl Drop for Guard {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

type Failures = Rc<RefCell<Vec<(String, String)>>>;

fn collect_failures(hub: &HubHandle, policy: FailurePolicy) -> Failures {
    let failures: Failures = Rc::default();
    let sink = Rc::clone(&failures);
    hub.set_failure_sink(move |origin: &str, error: &HubError| {
        sink.borrow_mut()
            .push((origin.to_string(), error.to_string()));
        policy
    });
    failures
}

#[test]
fn test_sleep_order() -> Result<()> {
    for hub in hubs() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let a = Rc::clone(&order);
        let first = hub.spawn(move |hub| {
            hub.sleep(Duration::from_millis(100))?;
            a.borrow_mut().push("A");
            Ok(())
        })?;
        let b = Rc::clone(&order);
        let second = hub.spawn(move |hub| {
            hub.sleep(Duration::from_millis(50))?;
            b.borrow_mut().push("B");
            Ok(())
        })?;
        hub.run()?;
        first.join()?;
        second.join()?;
        assert_eq!(vec!["B", "A"], *order.borrow(), "{}", hub.get_name());
        assert!(hub.is_idle());
    }
    Ok(())
}

#[test]
fn test_already_waiting() -> Result<()> {
    for hub in hubs() {
        let (a, b) = socket_pair();
        let fd = a.as_raw_fd();
        let reader = hub.spawn(move |hub| {
            hub.wait_read(fd)?;
            Ok(WakeCause::Io(fd, Direction::Read))
        })?;
        let contender = hub.spawn(move |hub| {
            let mut b = b;
            let second = hub.wait_read(fd);
            b.write_all(b"ping")?;
            Ok(second)
        })?;
        hub.run()?;
        assert_eq!(WakeCause::Io(fd, Direction::Read), reader.join()?);
        match contender.join()? {
            Err(HubError::AlreadyWaiting {
                fd: contended,
                direction: Direction::Read,
            }) => assert_eq!(fd, contended),
            other => panic!("{} unexpected {other:?}", hub.get_name()),
        }
        drop(a);
    }
    Ok(())
}

#[test]
fn test_reverse_readiness() -> Result<()> {
    for hub in hubs() {
        let (a1, b1) = socket_pair();
        let (a2, b2) = socket_pair();
        let resumed = Rc::new(RefCell::new(Vec::new()));
        for (n, fd) in [(1, a1.as_raw_fd()), (2, a2.as_raw_fd())] {
            let resumed = Rc::clone(&resumed);
            hub.spawn(move |hub| {
                hub.wait_read(fd)?;
                resumed.borrow_mut().push(n);
                Ok(())
            })?
            .detach();
        }
        let writer = hub.spawn(move |hub| {
            let (mut b1, mut b2) = (b1, b2);
            b2.write_all(b"second first")?;
            hub.sleep(Duration::from_millis(20))?;
            b1.write_all(b"first second")?;
            Ok(())
        })?;
        hub.run()?;
        writer.join()?;
        assert_eq!(vec![2, 1], *resumed.borrow(), "{}", hub.get_name());
        drop((a1, a2));
    }
    Ok(())
}

#[test]
fn test_kill_sleeping() -> Result<()> {
    for hub in hubs() {
        let failures = collect_failures(&hub, FailurePolicy::Continue);
        let dropped = Rc::new(Cell::new(false));
        let observed = Rc::new(Cell::new(false));
        let (flag, seen) = (Rc::clone(&dropped), Rc::clone(&observed));
        let sleeper = hub.spawn(move |hub| {
            let _guard = Guard(flag);
            let result = hub.sleep(Duration::from_secs(10));
            seen.set(matches!(result, Err(HubError::Cancelled)));
            result
        })?;
        let id = sleeper.id();
        let killer = hub.spawn(move |hub| {
            hub.sleep(Duration::from_millis(10))?;
            assert_eq!(Some(FiberState::SuspendedTimer), hub.fiber_state(id));
            hub.kill(id);
            assert_eq!(Some(FiberState::Runnable), hub.fiber_state(id));
            Ok(())
        })?;
        let start = Instant::now();
        hub.run()?;
        assert!(start.elapsed() < Duration::from_secs(5));
        killer.join()?;
        assert!(observed.get());
        assert!(dropped.get());
        assert!(sleeper.join().unwrap_err().is_cancelled());
        assert!(failures.borrow().is_empty());
        // killing a dead fiber is a no-op
        hub.kill(id);
    }
    Ok(())
}

#[test]
fn test_kill_before_start() -> Result<()> {
    for hub in hubs() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let victim = hub.spawn(move |_| {
            flag.set(true);
            Ok(())
        })?;
        victim.kill();
        let flag = Rc::clone(&ran);
        let delayed = hub.spawn_after(Duration::from_secs(10), move |_| {
            flag.set(true);
            Ok(())
        })?;
        assert_eq!(FiberState::New, delayed.state());
        delayed.kill();
        assert!(delayed.is_dead());
        hub.run()?;
        assert!(!ran.get());
        assert!(victim.join().unwrap_err().is_cancelled());
        assert!(delayed.join().unwrap_err().is_cancelled());
        assert!(hub.is_idle());
    }
    Ok(())
}

#[test]
fn test_kill_waiter_releases_fd() -> Result<()> {
    for hub in hubs() {
        let (a, b) = socket_pair();
        let fd = a.as_raw_fd();
        let first = hub.spawn(move |hub| hub.wait_read(fd))?;
        let id = first.id();
        let second = hub.spawn(move |hub| {
            let mut b = b;
            hub.kill(id);
            // the slot is free again
            b.write_all(b"ping")?;
            hub.wait_read(fd)
        })?;
        hub.run()?;
        assert!(first.join().unwrap_err().is_cancelled());
        second.join()?;
        drop(a);
    }
    Ok(())
}

#[test]
fn test_remote_wake_latency() -> Result<()> {
    for hub in hubs_with(|config| {
        _ = config.set_poll_ceiling(None);
    }) {
        assert_eq!(None, hub.config().get_poll_ceiling());
        let parked = hub.spawn(|hub| hub.park())?;
        let waiting = hub.spawn(|hub| hub.park())?;
        let remote = hub.remote();
        let (first, second) = (parked.id(), waiting.id());
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.unpark(first).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            remote
                .call(move |hub| {
                    flag.store(true, Ordering::Release);
                    hub.unpark(second);
                })
                .unwrap();
        });
        let start = Instant::now();
        hub.run()?;
        assert!(start.elapsed() < Duration::from_secs(5), "{}", hub.get_name());
        thread.join().unwrap();
        parked.join()?;
        waiting.join()?;
        assert!(called.load(Ordering::Acquire));
    }
    Ok(())
}

#[test]
fn test_remote_stop() -> Result<()> {
    for hub in hubs() {
        let dropped = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dropped);
        hub.spawn(move |hub| {
            let _guard = Guard(flag);
            hub.park()
        })?
        .detach();
        let remote = hub.remote();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.stop()
        });
        hub.run()?;
        thread.join().unwrap()?;
        assert_eq!(1, hub.fiber_count());
        assert!(!dropped.get());
        let remote = hub.remote();
        drop(hub);
        // teardown unwinds the parked stack
        assert!(dropped.get());
        assert!(matches!(remote.stop(), Err(HubError::HubGone)));
    }
    Ok(())
}

#[test]
fn test_join() -> Result<()> {
    for hub in hubs() {
        let answer = hub.spawn(|hub| {
            hub.sleep(Duration::from_millis(10))?;
            Ok(42)
        })?;
        let failing = hub.spawn(|_| -> Result<()> { panic!("boom") })?;
        let joiner = hub.spawn(move |hub| {
            let value = answer.join()?;
            let me = hub.current_fiber().ok_or(HubError::NotInFiber)?;
            assert_eq!(Some(FiberState::Running), hub.fiber_state(me));
            Ok(value + 1)
        })?;
        let panicked = hub.spawn(move |_| Ok(failing.join()))?;
        hub.run()?;
        assert_eq!(43, joiner.join()?);
        match panicked.join()? {
            Err(HubError::Panicked(message)) => assert!(message.contains("boom")),
            other => panic!("{} unexpected {other:?}", hub.get_name()),
        }
    }
    Ok(())
}

#[test]
fn test_join_outside_fiber() -> Result<()> {
    for hub in hubs() {
        let handle = hub.spawn(|hub| {
            hub.sleep(Duration::from_millis(10))?;
            Ok(String::from("done"))
        })?;
        assert_eq!("done", handle.join()?);
    }
    Ok(())
}

#[test]
fn test_join_self() -> Result<()> {
    let hub = Hub::new(config("join-self"))?;
    let slot: Rc<RefCell<Option<FiberHandle<()>>>> = Rc::default();
    let deadlocked = Rc::new(Cell::new(false));
    let (own, flag) = (Rc::clone(&slot), Rc::clone(&deadlocked));
    let handle = hub.spawn(move |hub| {
        // the handle is filled in once we were spawned
        hub.yield_now()?;
        let me = own.borrow_mut().take().ok_or(HubError::NotInFiber)?;
        flag.set(matches!(me.join(), Err(HubError::WouldDeadlock)));
        Ok(())
    })?;
    *slot.borrow_mut() = Some(handle);
    hub.run()?;
    assert!(deadlocked.get());
    Ok(())
}

#[test]
fn test_unjoined_failures() -> Result<()> {
    for hub in hubs() {
        let failures = collect_failures(&hub, FailurePolicy::Continue);
        hub.spawn_named("failing", |_| -> Result<()> { Err(HubError::TimedOut) })?
            .detach();
        hub.spawn_named("panicking", |_| -> Result<()> { panic!("lost") })?
            .detach();
        let cancelled = hub.spawn(|hub| hub.sleep(Duration::from_secs(10)))?;
        cancelled.kill();
        drop(cancelled);
        let late = hub.spawn_named("late", |_| -> Result<()> { Err(HubError::WouldDeadlock) })?;
        hub.run()?;
        assert_eq!(2, failures.borrow().len(), "{}", hub.get_name());
        // dropping the handle of a dead failed fiber reports it
        drop(late);
        let failures = failures.borrow();
        assert_eq!(3, failures.len());
        assert_eq!("failing", failures[0].0);
        assert_eq!("panicking", failures[1].0);
        assert!(failures[1].1.contains("lost"));
        assert_eq!("late", failures[2].0);
    }
    Ok(())
}

#[test]
fn test_sink_abort() -> Result<()> {
    for hub in hubs() {
        let failures = collect_failures(&hub, FailurePolicy::Abort);
        hub.spawn_named("fatal", |_| -> Result<()> { Err(HubError::TimedOut) })?
            .detach();
        let survivor = hub.spawn(|hub| hub.sleep(Duration::from_secs(10)))?;
        match hub.run() {
            Err(HubError::Unhandled { origin, message }) => {
                assert_eq!("fatal", origin);
                assert_eq!("timed out", message);
            }
            other => panic!("{} unexpected {other:?}", hub.get_name()),
        }
        assert_eq!(1, failures.borrow().len());
        assert!(!survivor.is_dead());
    }
    Ok(())
}

#[test]
fn test_abort_waiters() -> Result<()> {
    for hub in hubs() {
        let (a, _b) = socket_pair();
        let fd = a.as_raw_fd();
        let reader = hub.spawn(move |hub| hub.wait_read(fd))?;
        let writer = hub.spawn(move |hub| hub.wait_write_timeout(fd, Duration::from_secs(10)))?;
        // runs in the same batch, before the backend reports anything
        let closer = hub.spawn(move |hub| Ok(hub.abort_waiters(fd)))?;
        hub.run()?;
        assert_eq!(2, closer.join()?, "{}", hub.get_name());
        assert!(matches!(reader.join(), Err(HubError::Closed(closed)) if closed == fd));
        assert!(matches!(writer.join(), Err(HubError::Closed(closed)) if closed == fd));
        assert_eq!(0, hub.abort_waiters(fd));
        drop(a);
    }
    Ok(())
}

#[test]
fn test_closed_fd_wakes_waiter() -> Result<()> {
    for hub in hubs() {
        let (a, _b) = socket_pair();
        let fd = a.as_raw_fd();
        let socket = Rc::new(RefCell::new(Some(a)));
        let waiter = hub.spawn(move |hub| {
            let start = Instant::now();
            hub.wait_read_timeout(fd, Duration::from_secs(2))?;
            Ok(start.elapsed())
        })?;
        let owner = Rc::clone(&socket);
        let closer = hub.spawn(move |hub| {
            hub.sleep(Duration::from_millis(10))?;
            drop(owner.borrow_mut().take());
            Ok(())
        })?;
        hub.run()?;
        closer.join()?;
        let waited = waiter.join()?;
        assert!(
            waited < Duration::from_secs(1),
            "{} woke after {waited:?}",
            hub.get_name()
        );
        assert!(hub.inner.interests.borrow().is_empty());
        assert!(hub.is_idle());
    }
    Ok(())
}

#[test]
fn test_select_capacity() -> Result<()> {
    let limit = crate::net::select::select_limit();
    let mut rlimit: libc::rlimit = unsafe { std::mem::zeroed() };
    assert_eq!(0, unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) });
    let wanted = libc::rlim_t::try_from(limit * 2).unwrap();
    if rlimit.rlim_cur < wanted && rlimit.rlim_max >= wanted {
        rlimit.rlim_cur = wanted;
        _ = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) };
    }
    let (a, _b) = socket_pair();
    let floor = RawFd::try_from(limit).unwrap();
    let high = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if high < 0 {
        // no descriptor above FD_SETSIZE allowed on this machine
        return Ok(());
    }

    let mut config = config("select-capacity");
    _ = config.set_backend(BackendKind::Select);
    let hub = Hub::new(config)?;
    let low = a.as_raw_fd();
    let waiter = hub.spawn(move |hub| {
        let rejected = hub.wait_read(high);
        // a later wait on a descriptor in range is unaffected
        hub.wait_write(low)?;
        rejected
    })?;
    hub.run()?;
    match waiter.join() {
        Err(HubError::CapacityExceeded { fd, limit: l }) => {
            assert_eq!(high, fd);
            assert_eq!(limit, l);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(hub.inner.interests.borrow().is_empty());
    assert!(hub.is_idle());
    assert_eq!(0, unsafe { libc::close(high) });
    Ok(())
}

#[test]
fn test_wait_timeout() -> Result<()> {
    for hub in hubs() {
        let (a, _b) = socket_pair();
        let fd = a.as_raw_fd();
        let reader = hub.spawn(move |hub| {
            let start = Instant::now();
            let result = hub.wait_read_timeout(fd, Duration::from_millis(30));
            Ok((result, start.elapsed()))
        })?;
        let writer = hub.spawn(move |hub| hub.wait_write_timeout(fd, Duration::from_secs(10)))?;
        hub.run()?;
        let (result, elapsed) = reader.join()?;
        assert!(matches!(result, Err(HubError::TimedOut)), "{}", hub.get_name());
        assert!(elapsed >= Duration::from_millis(25));
        writer.join()?;
        assert!(hub.is_idle());
        drop(a);
    }
    Ok(())
}

#[test]
fn test_not_in_fiber() -> Result<()> {
    let hub = Hub::new(config("outside"))?;
    let (a, _b) = socket_pair();
    assert!(matches!(hub.wait_read(a.as_raw_fd()), Err(HubError::NotInFiber)));
    assert!(matches!(hub.yield_now(), Err(HubError::NotInFiber)));
    assert!(matches!(hub.park(), Err(HubError::NotInFiber)));
    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    _ = hub.schedule_call(Duration::from_millis(5), move |_| flag.set(true))?;
    let start = Instant::now();
    hub.sleep(Duration::from_millis(20))?;
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(fired.get());
    assert!(hub.is_idle());
    Ok(())
}

#[test]
fn test_yield_fifo() -> Result<()> {
    for hub in hubs() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let order = Rc::clone(&order);
                hub.spawn(move |hub| {
                    for i in 0..2 {
                        order.borrow_mut().push(format!("{name}{i}"));
                        hub.yield_now()?;
                    }
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        hub.run()?;
        for handle in handles {
            handle.join()?;
        }
        assert_eq!(
            vec!["a0", "b0", "c0", "a1", "b1", "c1"],
            *order.borrow(),
            "{}",
            hub.get_name()
        );
    }
    Ok(())
}

#[test]
fn test_spawn_not_inline() -> Result<()> {
    for hub in hubs() {
        let parent = hub.spawn(|hub| {
            let ran = Rc::new(Cell::new(false));
            let flag = Rc::clone(&ran);
            let child = hub.spawn(move |_| {
                flag.set(true);
                Ok(())
            })?;
            assert!(!ran.get());
            assert_eq!(hub.current_fiber(), child.spawner());
            hub.yield_now()?;
            assert!(ran.get());
            child.join()
        })?;
        hub.run()?;
        parent.join()?;
    }
    Ok(())
}

#[test]
fn test_schedule_call() -> Result<()> {
    for hub in hubs() {
        let failures = collect_failures(&hub, FailurePolicy::Continue);
        let order = Rc::new(RefCell::new(Vec::new()));
        let (late, early) = (Rc::clone(&order), Rc::clone(&order));
        _ = hub.schedule_call(Duration::from_millis(20), move |_| late.borrow_mut().push(2))?;
        _ = hub.schedule_call(Duration::from_millis(10), move |_| early.borrow_mut().push(1))?;
        let cancelled = Rc::clone(&order);
        let timer = hub.schedule_call(Duration::from_millis(5), move |_| {
            cancelled.borrow_mut().push(0);
        })?;
        assert!(hub.cancel_timer(timer));
        assert!(!hub.cancel_timer(timer));
        _ = hub.schedule_call(Duration::from_millis(1), |_| panic!("callback"))?;
        hub.run()?;
        assert_eq!(vec![1, 2], *order.borrow(), "{}", hub.get_name());
        assert_eq!(1, failures.borrow().len());
        assert!(failures.borrow()[0].1.contains("callback"));
    }
    Ok(())
}

#[test]
fn test_cancel_while_firing() -> Result<()> {
    let hub = Hub::new(config("firing"))?;
    let order = Rc::new(RefCell::new(Vec::new()));
    let victim = Rc::new(Cell::new(None));
    let (first, second) = (Rc::clone(&order), Rc::clone(&order));
    let target = Rc::clone(&victim);
    _ = hub.schedule_call(Duration::ZERO, move |hub| {
        first.borrow_mut().push("first");
        if let Some(timer) = target.get() {
            assert!(hub.cancel_timer(timer));
        }
        // inserted while firing, waits for the next iteration
        let again = Rc::clone(&first);
        _ = hub
            .schedule_call(Duration::ZERO, move |_| again.borrow_mut().push("next"))
            .unwrap();
    })?;
    victim.set(Some(hub.schedule_call(Duration::ZERO, move |_| {
        second.borrow_mut().push("cancelled");
    })?));
    hub.run_once()?;
    assert_eq!(vec!["first"], *order.borrow());
    hub.run()?;
    assert_eq!(vec!["first", "next"], *order.borrow());
    Ok(())
}

#[test]
fn test_park_permit() -> Result<()> {
    for hub in hubs() {
        let handle = hub.spawn(|hub| {
            let me = hub.current_fiber().ok_or(HubError::NotInFiber)?;
            hub.unpark(me);
            // consumes the permit without suspending
            hub.park()
        })?;
        hub.run()?;
        handle.join()?;
    }
    Ok(())
}

#[test]
fn test_reentry() -> Result<()> {
    let hub = Hub::new(config("reentry"))?;
    let handle = hub.spawn(|hub| {
        assert!(matches!(hub.run(), Err(HubError::AlreadyRunning(_))));
        assert!(matches!(hub.run_once(), Err(HubError::AlreadyRunning(_))));
        Ok(())
    })?;
    hub.run()?;
    handle.join()
}

#[test]
fn test_unsupported_backend() {
    let mut config = config("unsupported");
    _ = config.set_backend(BackendKind::External);
    assert!(matches!(
        Hub::new(config.clone()),
        Err(HubError::UnsupportedBackend(_))
    ));
    for kind in [BackendKind::Epoll, BackendKind::Kqueue] {
        if !kind.is_supported() {
            _ = config.set_backend(kind);
            assert!(matches!(
                Hub::new(config.clone()),
                Err(HubError::UnsupportedBackend(_))
            ));
        }
    }
}

#[derive(Debug, Default)]
struct Counting {
    spawned: Cell<usize>,
    resumed: Cell<usize>,
    suspended: Cell<usize>,
    dead: RefCell<Vec<FiberId>>,
}

impl Listener for Rc<Counting> {
    fn on_spawn(&self, _fiber: FiberId, _name: &str) {
        self.spawned.set(self.spawned.get() + 1);
    }

    fn on_resume(&self, _fiber: FiberId, _name: &str, _cause: WakeCause) {
        self.resumed.set(self.resumed.get() + 1);
    }

    fn on_suspend(&self, _fiber: FiberId, _name: &str, state: FiberState) {
        assert!(state.is_suspended() || state == FiberState::Runnable);
        self.suspended.set(self.suspended.get() + 1);
    }

    fn on_dead(&self, fiber: FiberId, _name: &str, _failure: Option<&HubError>) {
        self.dead.borrow_mut().push(fiber);
    }
}

#[test]
fn test_every_fiber_dies_once() -> Result<()> {
    for hub in hubs() {
        let counting = Rc::new(Counting::default());
        hub.add_listener(Rc::clone(&counting));
        for i in 0..8_u64 {
            hub.spawn(move |hub| {
                hub.sleep(Duration::from_millis(i))?;
                hub.yield_now()?;
                if i % 3 == 0 {
                    return Err(HubError::TimedOut);
                }
                Ok(())
            })?
            .detach();
        }
        hub.run()?;
        assert_eq!(8, counting.spawned.get());
        assert_eq!(24, counting.resumed.get());
        assert_eq!(16, counting.suspended.get());
        let mut dead = counting.dead.borrow().clone();
        dead.sort();
        dead.dedup();
        assert_eq!(8, dead.len(), "{}", hub.get_name());
    }
    Ok(())
}

#[test]
fn test_teardown() -> Result<()> {
    let hub = Hub::new(config("teardown"))?;
    let dropped = Rc::new(Cell::new(false));
    let flag = Rc::clone(&dropped);
    let sleeper = hub.spawn(move |hub| {
        let _guard = Guard(flag);
        hub.sleep(Duration::from_secs(10))
    })?;
    hub.spawn(|hub| {
        hub.stop();
        Ok(())
    })?
    .detach();
    hub.run()?;
    assert_eq!(FiberState::SuspendedTimer, sleeper.state());
    let handle = hub.handle();
    drop(hub);
    assert!(dropped.get());
    assert!(handle.is_closed());
    assert!(matches!(handle.spawn(|_| Ok(())), Err(HubError::HubGone)));
    assert!(matches!(handle.run(), Err(HubError::HubGone)));
    assert!(sleeper.join().unwrap_err().is_cancelled());
    Ok(())
}

#[test]
fn test_backtrace_in_fiber() -> Result<()> {
    let hub = Hub::new(config("backtrace"))?;
    let handle = hub.spawn(|_| Ok(backtrace::Backtrace::new_unresolved().frames().len()))?;
    hub.run()?;
    assert!(handle.join()? > 0);
    Ok(())
}

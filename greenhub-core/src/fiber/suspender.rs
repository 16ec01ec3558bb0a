use crate::common::page_size;
use crate::error::Result;
use crate::fiber::constants::WakeCause;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};

/// The stackful coroutine behind every fiber.
pub(crate) type FiberCoroutine = Coroutine<WakeCause, (), Result<()>, DefaultStack>;

/// Suspends the fiber it was handed to.
///
/// Only valid while that fiber's stack exists, which is as long as the fiber is not
/// dead.
#[derive(Copy, Clone)]
pub(crate) struct Suspender(*const Yielder<WakeCause, ()>);

impl std::fmt::Debug for Suspender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Suspender").field(&self.0).finish()
    }
}

impl Suspender {
    /// Switch back to the hub, returning the cause the fiber is resumed with.
    ///
    /// Must be called on the fiber's own stack.
    pub(crate) fn suspend(self) -> WakeCause {
        unsafe { (*self.0).suspend(()) }
    }
}

/// Create a coroutine running `body` on a fresh stack of at least one page.
pub(crate) fn create(
    stack_size: usize,
    body: impl FnOnce(Suspender, WakeCause) -> Result<()> + 'static,
) -> std::io::Result<FiberCoroutine> {
    let stack = DefaultStack::new(stack_size.max(page_size()))?;
    Ok(Coroutine::with_stack(
        stack,
        move |yielder: &Yielder<WakeCause, ()>, cause| body(Suspender(yielder), cause),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corosensei::CoroutineResult;

    #[test]
    fn suspend_and_resume() -> std::io::Result<()> {
        let mut coroutine = create(16 * 1024, |suspender, first| {
            assert_eq!(WakeCause::Spawned, first);
            assert_eq!(WakeCause::Timer, suspender.suspend());
            assert_eq!(WakeCause::Unparked, suspender.suspend());
            Ok(())
        })?;
        assert!(matches!(
            coroutine.resume(WakeCause::Spawned),
            CoroutineResult::Yield(())
        ));
        assert!(matches!(
            coroutine.resume(WakeCause::Timer),
            CoroutineResult::Yield(())
        ));
        assert!(matches!(
            coroutine.resume(WakeCause::Unparked),
            CoroutineResult::Return(Ok(()))
        ));
        assert!(coroutine.done());
        Ok(())
    }

    #[test]
    fn drop_unwinds_suspended() -> std::io::Result<()> {
        struct Guard(std::rc::Rc<std::cell::Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        let dropped = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = dropped.clone();
        let mut coroutine = create(16 * 1024, move |suspender, _| {
            let _guard = Guard(flag);
            _ = suspender.suspend();
            Ok(())
        })?;
        assert!(matches!(
            coroutine.resume(WakeCause::Spawned),
            CoroutineResult::Yield(())
        ));
        assert!(!dropped.get());
        drop(coroutine);
        assert!(dropped.get());
        Ok(())
    }
}

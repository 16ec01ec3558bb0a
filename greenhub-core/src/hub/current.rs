use crate::common::Current;
use crate::hub::HubHandle;
use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static HUB: RefCell<VecDeque<HubHandle>> = RefCell::new(VecDeque::new());
}

impl Current for HubHandle {
    fn init_current(current: &Self)
    where
        Self: Sized,
    {
        HUB.with(|s| s.borrow_mut().push_front(current.clone()));
    }

    fn current() -> Option<Self>
    where
        Self: Sized,
    {
        HUB.with(|s| s.borrow().front().cloned())
    }

    fn clean_current()
    where
        Self: Sized,
    {
        HUB.with(|s| _ = s.borrow_mut().pop_front());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Named;
    use crate::config::Config;
    use crate::hub::Hub;

    fn named(name: &str) -> crate::error::Result<Hub> {
        let mut config = Config::default();
        _ = config.set_name(name);
        Hub::new(config)
    }

    #[test]
    fn test_current() -> crate::error::Result<()> {
        assert!(HubHandle::current().is_none());
        let parent = named("parent")?;
        let outer = parent.spawn(|_| {
            assert_eq!("parent", HubHandle::current().unwrap().get_name());
            let child = named("child")?;
            let inner = child.spawn(|_| {
                assert_eq!("child", HubHandle::current().unwrap().get_name());
                Ok(())
            })?;
            child.run()?;
            inner.join()?;
            assert_eq!("parent", HubHandle::current().unwrap().get_name());
            Ok(())
        })?;
        parent.run()?;
        outer.join()?;
        assert!(HubHandle::current().is_none());
        Ok(())
    }
}

//! Ambient "current clock" for the running thread

use std::cell::RefCell;

use crate::clock::Clock;

thread_local! {
    static CURRENT: RefCell<Vec<Clock>> = const { RefCell::new(Vec::new()) };
}

/// The clock whose action, dispatched message or roused callback is running on this thread
pub fn current_clock() -> Option<Clock> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Makes a clock current until dropped; scopes nest
pub struct ClockScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ClockScope {
    pub fn enter(clock: &Clock) -> Self {
        CURRENT.with(|stack| stack.borrow_mut().push(clock.clone()));
        Self { _not_send: std::marker::PhantomData }
    }
}

impl Drop for ClockScope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

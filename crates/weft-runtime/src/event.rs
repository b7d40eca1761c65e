//! A condition-variable-like suspension primitive for fibers.
//!
//! A fiber calls [`Event::wait`] to park until some other fiber (or the
//! loop's dispatcher) calls [`Event::trigger`]. Triggering wakes every
//! waiter; a trigger with no waiters is a no-op, so the usual pattern is
//! to re-check the guarded condition in a loop around `wait()`.

use std::cell::RefCell;

use weft_core::FiberId;

use crate::scheduler;

/// One-shot wakeup channel between fibers on the loop thread.
#[derive(Default)]
pub struct Event {
    waiters: RefCell<Vec<FiberId>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the current fiber until the next [`trigger`](Self::trigger).
    ///
    /// # Panics
    ///
    /// Panics when called outside fiber context.
    pub fn wait(&self) {
        let id = scheduler::current_fiber().expect("Event::wait outside a fiber");
        self.waiters.borrow_mut().push(id);
        scheduler::suspend_current();
    }

    /// Resume every fiber parked on this event.
    pub fn trigger(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for id in waiters {
            scheduler::resume(id);
        }
    }

    /// Number of fibers currently parked.
    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_wait_then_trigger() {
        let mut sched = Scheduler::new(128 * 1024);
        let event = Rc::new(Event::new());
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..2 {
            let event = event.clone();
            let log = log.clone();
            sched
                .spawn(
                    move || {
                        log.borrow_mut().push("waiting");
                        event.wait();
                        log.borrow_mut().push("woken");
                    },
                    0,
                    false,
                )
                .unwrap();
        }
        {
            let event = event.clone();
            let log = log.clone();
            sched
                .spawn(
                    move || {
                        assert_eq!(event.waiter_count(), 2);
                        log.borrow_mut().push("triggering");
                        event.trigger();
                    },
                    0,
                    false,
                )
                .unwrap();
        }

        sched.run();
        assert_eq!(
            *log.borrow(),
            vec!["waiting", "waiting", "triggering", "woken", "woken"]
        );
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn test_trigger_without_waiters_is_noop() {
        let mut sched = Scheduler::new(128 * 1024);
        let event = Rc::new(Event::new());
        {
            let event = event.clone();
            sched.spawn(move || event.trigger(), 0, false).unwrap();
        }
        sched.run();
    }
}

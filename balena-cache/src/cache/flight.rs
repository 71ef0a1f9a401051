use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One in-progress refresh that any number of callers can wait on.
///
/// The outcome is written exactly once by the refresh thread; every waiter
/// receives its own clone.
pub(crate) struct Flight<T: Clone> {
    outcome: Mutex<Option<T>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    pub(crate) fn new() -> Self {
        Flight {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: T) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    /// Block until the outcome is available. `None` means the timeout passed
    /// first; the flight itself carries on. A timeout too large to represent
    /// waits without a deadline.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out() {
                        return (*slot).clone();
                    }
                }
                None => self.done.wait(&mut slot),
            }
        }
    }
}

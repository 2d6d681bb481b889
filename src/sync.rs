//! Counting semaphore used for service release credits.
//!
//! Every sequencer post is one release credit; a slow service accumulates
//! credits and works them off one wait at a time. Credits are never merged.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<u64>,
    available: Condvar,
}

fn recover<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Add one credit and wake one waiter.
    pub fn post(&self) {
        let mut count = recover(self.count.lock());
        *count += 1;
        self.available.notify_one();
    }

    /// Block until a credit is available and take it.
    pub fn wait(&self) {
        let guard = recover(self.count.lock());
        let mut guard: MutexGuard<'_, u64> =
            recover(self.available.wait_while(guard, |count| *count == 0));
        *guard -= 1;
    }

    /// Take a credit, waiting at most `timeout`. Returns whether a credit was
    /// taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = recover(self.count.lock());
        let (mut guard, result) = recover(
            self.available
                .wait_timeout_while(guard, timeout, |count| *count == 0),
        );
        if result.timed_out() && *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    /// Outstanding credits.
    pub fn count(&self) -> u64 {
        *recover(self.count.lock())
    }
}

//! Blocking primitives.
//!
//! `spin::Mutex` guards short critical sections that never sleep (free list,
//! queue channels, listener table). Anything that has to sleep goes through
//! [`Completion`], a counting wakeup with a deadline on every wait.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::time::Deadline;

/// Counting completion.
///
/// Starts unsignaled. Every [`complete`](Completion::complete) banks one
/// wakeup; every successful wait consumes one.
#[derive(Debug, Default)]
pub struct Completion {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Bank one wakeup and wake waiters.
    pub fn complete(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_add(1);
        self.cond.notify_all();
    }

    /// Consume a banked wakeup without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Wait up to `timeout` for a wakeup. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }

    /// Drop every banked wakeup.
    pub fn reset(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}

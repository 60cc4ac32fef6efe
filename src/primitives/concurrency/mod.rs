#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot broadcast latch.
///
/// A single writer publishes a value with [`DoneSignal::set`]; any number of
/// waiters block until it is published. Waiters arriving after publication
/// return immediately, so no wakeup can be missed.
#[derive(Debug)]
pub struct DoneSignal<T: Copy> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Copy> Default for DoneSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> DoneSignal<T> {
    /// Creates an unpublished latch.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Publishes `value` and wakes every waiter.
    ///
    /// Returns `false` if a value had already been published; the original
    /// value is kept.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.cond.notify_all();
        true
    }

    /// Returns the published value without blocking.
    pub fn get(&self) -> Option<T> {
        *self.value.lock()
    }

    /// Returns `true` once a value has been published.
    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until a value is published.
    pub fn wait(&self) -> T {
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = *slot {
                return value;
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Blocks until a value is published or `timeout` elapses.
    ///
    /// `None` waits indefinitely. Returns `None` only on timeout.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Option<T> {
        let Some(timeout) = timeout else {
            return Some(self.wait());
        };
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = *slot {
                return Some(value);
            }
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return *slot;
            }
        }
    }
}

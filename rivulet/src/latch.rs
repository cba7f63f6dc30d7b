//! One-shot cross-thread readiness signal.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A one-shot latch: once set it stays set, and every waiter is released.
///
/// Typically set from a terminal callback on the engine thread and waited
/// on by the consumer thread.
#[derive(Debug, Clone, Default)]
pub struct ReadinessLatch {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the latch ready and wake all waiters. Idempotent.
    pub fn set_ready(&self) {
        let mut ready = self.lock();
        if !*ready {
            *ready = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.lock()
    }

    /// Block until the latch is set.
    pub fn wait(&self) {
        let mut ready = self.lock();
        while !*ready {
            ready = self
                .inner
                .cond
                .wait(ready)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the latch is set or `timeout` elapses. Returns true if set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.lock();
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            ready = self
                .inner
                .cond
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // The guarded value is a plain flag, so a poisoned lock is still usable.
        self.inner
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn set_before_wait() {
        let latch = ReadinessLatch::new();
        assert!(!latch.is_ready());
        latch.set_ready();
        latch.set_ready();
        assert!(latch.is_ready());
        latch.wait();
    }

    #[test]
    fn releases_waiter_on_other_thread() {
        let latch = ReadinessLatch::new();
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(10));
        latch.set_ready();
        waiter.join().unwrap();
    }

    #[test]
    fn releases_every_waiter() {
        let latch = ReadinessLatch::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        latch.set_ready();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn wait_timeout_expires() {
        let latch = ReadinessLatch::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}

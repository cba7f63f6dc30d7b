//! Monotonic millisecond clock shared by the loop and transport threads.

use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A point in time, in milliseconds since the engine clock's origin.
///
/// The origin is anchored at wall-clock epoch milliseconds when the clock is
/// created, so values are always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Millis(u64);

impl Millis {
    pub const fn new(ms: u64) -> Self {
        Millis(ms)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<Millis> for u64 {
    fn from(m: Millis) -> u64 {
        m.0
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Wall-clock anchored, monotonically advancing clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_ms: u64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        Clock {
            origin: Instant::now(),
            origin_ms,
        }
    }

    /// Current time. Never goes backwards, even if the wall clock does.
    pub fn now(&self) -> Millis {
        Millis(self.origin_ms + self.origin.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_positive_and_monotonic() {
        let clock = Clock::new();
        let mut prev = clock.now();
        assert!(prev.as_u64() > 0);
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn copies_share_origin() {
        let clock = Clock::new();
        let copy = clock;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let a = clock.now();
        let b = copy.now();
        assert!(b >= a);
        assert!(b.as_u64() - a.as_u64() < 1000);
    }
}

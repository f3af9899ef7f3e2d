//! Monotonic time source shared by every time-dependent component
//!
//! Production code runs on [`MonotonicClock`]; tests drive a [`ManualClock`]
//! so cooldowns and phase windows can be crossed without sleeping.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Wraps `Instant::now()`
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn shared() -> SharedClock {
        Arc::new(MonotonicClock)
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Instant::now()),
        })
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Move the clock forward by whole milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance_ms(250);
        assert_eq!(clock.now().duration_since(start), Duration::from_millis(250));
    }

    #[test]
    fn test_manual_clock_frozen() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}

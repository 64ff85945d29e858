//! Clock abstraction.
//!
//! The pacer's NIC-queue estimator and the recovery machinery reason in
//! "cycles": an arbitrary monotonic unit whose rate is reported by the
//! source. The default source is backed by [`quanta`] and uses
//! nanoseconds as the cycle unit.

use std::sync::atomic::{AtomicU64, Ordering};

use quanta::Clock;

/// Source of monotonic time for the transport.
pub trait TimeSource: Send + Sync + 'static {
    /// Return the current time, in cycle units.
    fn now_cycles(&self) -> u64;

    /// Return the number of cycle units per second.
    fn cycles_per_sec(&self) -> u64;
}

/// Default wall-clock time source (one nanosecond per cycle).
pub struct MonotonicTime {
    clock: Clock,
    origin: u64,
}

impl MonotonicTime {
    pub fn new() -> Self {
        let clock = Clock::new();
        let origin = clock.raw();
        Self { clock, origin }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    #[inline]
    fn now_cycles(&self) -> u64 {
        self.clock.delta_as_nanos(self.origin, self.clock.raw())
    }

    #[inline]
    fn cycles_per_sec(&self) -> u64 {
        1_000_000_000
    }
}

/// A clock that only moves when told to. Used by tests that need
/// deterministic pacer and timer behavior.
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `cycles`.
    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::SeqCst);
    }
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTime {
    #[inline]
    fn now_cycles(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    #[inline]
    fn cycles_per_sec(&self) -> u64 {
        1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances() {
        let t = MonotonicTime::new();
        let a = t.now_cycles();
        let b = t.now_cycles();
        assert!(b >= a);
    }

    #[test]
    fn manual_is_controlled() {
        let t = ManualTime::new();
        assert_eq!(t.now_cycles(), 0);
        t.advance(500);
        assert_eq!(t.now_cycles(), 500);
    }
}

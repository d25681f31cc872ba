//! Time sources for the remote role's liveness bound.
//!
//! This module provides:
//! - [`Clock`]: trait for monotonic time sources
//! - [`SystemClock`]: monotonic system clock
//! - [`ManualClock`]: test clock advanced by hand or on every read

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Clock Trait
// ============================================================================

/// A monotonic time source.
///
/// The remote role has no way to observe whether its peer is alive, so its
/// polling loops measure idle time against a clock. Time is relative to an
/// arbitrary epoch and never goes backwards.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// System monotonic clock.
///
/// Uses `std::time::Instant`. Time is relative to when the clock was created.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a new system clock with the current instant as epoch.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn name(&self) -> &str {
        "system-monotonic"
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock that only moves when told to.
///
/// With a non-zero tick, every [`now`](Clock::now) call advances the clock by
/// the tick before reading it, which lets a polling loop "wait" through a
/// timeout without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    tick: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that advances by `tick` on every read.
    pub fn ticking(tick: Duration) -> Self {
        let clock = Self::new();
        clock.set_tick(tick);
        clock
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Change the per-read advance.
    pub fn set_tick(&self, tick: Duration) {
        self.tick.store(tick.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let tick = self.tick.load(Ordering::SeqCst);
        let nanos = self.nanos.fetch_add(tick, Ordering::SeqCst) + tick;
        Duration::from_nanos(nanos)
    }

    fn name(&self) -> &str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
        assert_eq!(clock.name(), "system-monotonic");
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_millis(5));
    }

    #[test]
    fn test_manual_clock_ticks_on_read() {
        let clock = ManualClock::ticking(Duration::from_micros(10));
        assert_eq!(clock.now(), Duration::from_micros(10));
        assert_eq!(clock.now(), Duration::from_micros(20));
        clock.set_tick(Duration::ZERO);
        assert_eq!(clock.now(), Duration::from_micros(20));
    }
}

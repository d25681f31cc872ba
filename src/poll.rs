//! Polling policy for the busy-wait loops of the transfer engine.

use std::time::Duration;

use crate::clock::Clock;
use crate::config::{DEFAULT_DELAY_PEEK, DEFAULT_TIMEOUT, UdmaConfig};

/// Spins before a waiting loop starts yielding its time slice.
const SPIN_LIMIT: u32 = 64;

/// How the engine waits on mailboxes and descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Longest the remote role may go without progress.
    pub timeout: Duration,
    /// Sleep between polls once spinning is exhausted; zero only yields.
    pub poll_interval: Duration,
    /// Local mailbox polls between peeks at the outstanding remote call.
    pub peek_every: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::ZERO,
            peek_every: DEFAULT_DELAY_PEEK,
        }
    }
}

impl PollPolicy {
    /// Policy derived from a transport configuration.
    pub fn from_config(config: &UdmaConfig) -> Self {
        Self {
            timeout: config.timeout,
            poll_interval: Duration::ZERO,
            peek_every: config.delay_peek.max(1),
        }
    }

    /// Replace the liveness bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A fresh backoff for one waiting loop.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            step: 0,
            interval: self.poll_interval,
        }
    }
}

/// Spin-then-yield waiting within one polling loop.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    interval: Duration,
}

impl Backoff {
    /// Wait a little before the next poll.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            self.step += 1;
            std::hint::spin_loop();
        } else if self.interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.interval);
        }
    }

    /// Progress was made; go back to spinning.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Tracks how long a loop has gone without progress.
pub struct IdleTimer<'c> {
    clock: &'c dyn Clock,
    since: Duration,
    timeout: Duration,
}

impl<'c> IdleTimer<'c> {
    /// Start timing now.
    pub fn start(clock: &'c dyn Clock, timeout: Duration) -> Self {
        Self {
            since: clock.now(),
            clock,
            timeout,
        }
    }

    /// Progress was made.
    pub fn reset(&mut self) {
        self.since = self.clock.now();
    }

    /// The idle time if it exceeds the bound.
    pub fn expired(&self) -> Option<Duration> {
        let idle = self.clock.now().saturating_sub(self.since);
        (idle > self.timeout).then_some(idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_idle_timer_expires_and_resets() {
        let clock = ManualClock::new();
        let mut timer = IdleTimer::start(&clock, Duration::from_millis(10));
        assert_eq!(timer.expired(), None);

        clock.advance(Duration::from_millis(11));
        assert_eq!(timer.expired(), Some(Duration::from_millis(11)));

        timer.reset();
        assert_eq!(timer.expired(), None);
    }

    #[test]
    fn test_policy_from_config() {
        let config = UdmaConfig::default().with_timeout(Duration::from_millis(3));
        let policy = PollPolicy::from_config(&config);
        assert_eq!(policy.timeout, Duration::from_millis(3));
        assert_eq!(policy.peek_every, 1);
    }

    #[test]
    fn test_backoff_keeps_spinning_after_reset() {
        let mut backoff = PollPolicy::default().backoff();
        for _ in 0..(SPIN_LIMIT + 2) {
            backoff.snooze();
        }
        assert_eq!(backoff.step, SPIN_LIMIT);
        backoff.reset();
        assert_eq!(backoff.step, 0);
    }
}

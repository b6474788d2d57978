//! Exponential reconnect backoff.

use std::time::Duration;

/// Delay between reconnect attempts: `initial * 2^failures`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    /// The wait the next failure will use.
    pub fn current(&self) -> Duration {
        // 2^31 seconds is far past any sane cap
        let factor = 1u32.checked_shl(self.failures.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// A connection succeeded: start over.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_failure() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_n_failures_wait_initial_times_two_pow_n() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(3600));
        for n in 0..10u32 {
            assert_eq!(b.current(), Duration::from_millis(100 * 2u64.pow(n)));
            b.next_delay();
        }
    }

    #[test]
    fn test_capped_at_max() {
        let mut b = Backoff::default();
        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.current(), Duration::from_secs(300));
        // and many more failures do not overflow
        for _ in 0..100 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(300));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}

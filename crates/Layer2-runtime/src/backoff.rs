//! Exponential backoff without jitter
//!
//! Restart and reconnect schedules must be reproducible, so delays are
//! exactly `base * 2^attempt` capped at `max`.

use std::time::Duration;

/// Doubling backoff state
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay (milliseconds)
    base_ms: u64,

    /// Upper bound on any delay (milliseconds)
    max_ms: u64,

    /// Delay that the next call to `next_delay` returns
    current_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        let max_ms = max_ms.max(base_ms);
        Self {
            base_ms,
            max_ms,
            current_ms: base_ms,
        }
    }

    /// Return the current delay and double the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Delay the next failure will wait, without advancing
    pub fn peek(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = Backoff::new(1000, 5000);
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_millis(1000));
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let mut backoff = Backoff::new(100, 10);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}

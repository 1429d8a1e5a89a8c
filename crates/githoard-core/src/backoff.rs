//! Jittered exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with an optional random jitter component.
///
/// The delay for attempt `n` is `min * factor^n`, capped at `max`. With
/// jitter enabled a random amount in `[0, min/2)` is added, still capped at
/// `max`, to keep concurrent producers from waking in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: u32,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: u32, jitter: bool) -> Self {
        Self {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// The delay to sleep before the next retry. Advances the attempt
    /// counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // checked_pow saturates misconfigured attempt counts instead of
        // overflowing the multiplier.
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        let exp_delay = self.min.checked_mul(multiplier).unwrap_or(self.max);
        let capped = exp_delay.min(self.max);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max)
    }
}

impl Default for Backoff {
    /// The defaults used by producers backing off from a saturated
    /// downstream: 500 ms to 5 s, factor 4, jittered.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 4, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 4, false);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1600));
    }

    #[test]
    fn caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 4, false);
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 4, false);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 4, true);
        for _ in 0..32 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(1), 4, true);
        for _ in 0..32 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
    }
}

//! Doubling backoff shared by store retries and source reconnects.
//!
//! A [`RetryPolicy`] is the immutable description; each retry loop takes a
//! fresh [`Backoff`] from it and asks for delays until it gives up or
//! succeeds. Store accruals use a bounded policy so a stuck store escalates,
//! the pipeline reconnects with an unbounded one.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Retries allowed after the first attempt; `None` never gives up.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn bounded(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_retries: Some(max_retries),
        }
    }

    pub fn unbounded(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_retries: None,
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// retry budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || self.max_retries.is_some_and(|limit| retry > limit) {
            return None;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

impl Default for RetryPolicy {
    /// Five retries from 100 ms, capped at 10 s.
    fn default() -> Self {
        Self::bounded(5, Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Per-loop retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    /// Delay before the next retry; `None` means give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.retries + 1)?;
        self.retries += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn bounded_policy_doubles_then_gives_up() {
        let mut b = RetryPolicy::bounded(3, 100 * MS, 30 * 1000 * MS).backoff();
        assert_eq!(b.next_delay(), Some(100 * MS));
        assert_eq!(b.next_delay(), Some(200 * MS));
        assert_eq!(b.next_delay(), Some(400 * MS));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.retries(), 3);
    }

    #[test]
    fn unbounded_policy_saturates_at_cap() {
        let policy = RetryPolicy::unbounded(500 * MS, 60 * 1000 * MS);
        assert_eq!(policy.delay_for(8), Some(60 * 1000 * MS));
        assert_eq!(policy.delay_for(1_000), Some(60 * 1000 * MS));

        let mut b = policy.backoff();
        for _ in 0..200 {
            assert!(b.next_delay().is_some());
        }
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut b = RetryPolicy::unbounded(10 * MS, 1000 * MS).backoff();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Some(10 * MS));
    }

    #[test]
    fn zero_retries_never_waits() {
        let mut b = RetryPolicy::bounded(0, 100 * MS, 1000 * MS).backoff();
        assert_eq!(b.next_delay(), None);
        assert_eq!(RetryPolicy::default().delay_for(0), None);
    }
}

//! Pure backoff computation.
//!
//! Kept separate from the orchestrator so delay math is testable without a
//! running execution.

use std::time::Duration;

use crate::definition::RetryPolicy;

/// Delay before retry attempt `retry_count` (zero-based):
/// `delay_ms * backoff_multiplier^retry_count`, rounded to whole milliseconds.
///
/// # Examples
///
/// ```
/// use taskloom::definition::RetryPolicy;
/// use taskloom::retry::retry_delay_ms;
///
/// let policy = RetryPolicy::new(2, 100).with_backoff(2.0);
/// assert_eq!(retry_delay_ms(&policy, 0), 100);
/// assert_eq!(retry_delay_ms(&policy, 1), 200);
/// assert_eq!(retry_delay_ms(&policy, 2), 400);
/// ```
#[must_use]
pub fn retry_delay_ms(policy: &RetryPolicy, retry_count: u32) -> u64 {
    let factor = policy.backoff_multiplier.powi(retry_count as i32);
    let scaled = policy.delay_ms as f64 * factor;
    if !scaled.is_finite() || scaled < 0.0 {
        return policy.delay_ms;
    }
    scaled.round() as u64
}

/// [`retry_delay_ms`] as a [`Duration`].
#[must_use]
pub fn retry_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    Duration::from_millis(retry_delay_ms(policy, retry_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_policy_has_constant_delay() {
        let policy = RetryPolicy::new(5, 250);
        for count in 0..5 {
            assert_eq!(retry_delay_ms(&policy, count), 250);
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::new(3, 100).with_backoff(2.0);
        assert_eq!(retry_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(&policy, 2), Duration::from_millis(400));
    }

    #[test]
    fn fractional_multiplier_rounds() {
        let policy = RetryPolicy::new(2, 100).with_backoff(1.5);
        assert_eq!(retry_delay_ms(&policy, 1), 150);
        assert_eq!(retry_delay_ms(&policy, 2), 225);
    }

    #[test]
    fn degenerate_multiplier_falls_back_to_base_delay() {
        let policy = RetryPolicy::new(2, 100).with_backoff(-1.0);
        // Odd powers go negative; fall back rather than underflow.
        assert_eq!(retry_delay_ms(&policy, 1), 100);
    }
}

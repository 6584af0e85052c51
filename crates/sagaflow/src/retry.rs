//! Backoff between failed step attempts.

use std::time::Duration;

use rand::Rng;

/// Delay policy applied between attempts of a failing step.
///
/// The number of attempts comes from the step's retry budget
/// (`max_retries`); this policy only decides how long to wait before the
/// next one. The default retries immediately.
///
/// # Backoff Calculation
///
/// The delay after failed attempt N is `min(base_delay * 2^(N-1), max_delay)`.
/// With `jitter` enabled the delay is drawn uniformly from `[0, delay]`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::RetryPolicy;
///
/// let immediate = RetryPolicy::default();
/// assert_eq!(immediate.backoff_duration(3), Duration::ZERO);
///
/// let policy = RetryPolicy {
///     base_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     jitter: false,
/// };
/// assert_eq!(policy.backoff_duration(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt. Default: zero (retry immediately).
    pub base_delay: Duration,

    /// Upper bound on the delay. Default: 30 seconds.
    pub max_delay: Duration,

    /// Randomize the delay to spread out retries of concurrent sagas.
    /// Default: `false`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if another attempt should be made.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    /// * `max_retries` - Retries allowed after the first attempt
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt <= max_retries
    }

    /// Calculate the wait before the next attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * 2^(attempt-1), capped at max
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let nanos = rand::rng().random_range(0..=delay.as_nanos() as u64);
            Duration::from_nanos(nanos)
        } else {
            delay
        }
    }
}

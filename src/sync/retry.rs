use std::time::Duration;

/// Default number of failed attempts before a mutation is dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Delay after the first failure; doubles with every further failure.
const DEFAULT_BASE_DELAY_SECS: u64 = 5;

/// Upper bound for the delay between attempts.
const DEFAULT_MAX_DELAY_SECS: u64 = 15 * 60;

/// Bounded retry schedule for queued mutations: capped exponential backoff,
/// dead-letter after `max_attempts` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
      max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
    }
  }
}

impl RetryPolicy {
  /// Wait before the next attempt once `attempts` attempts have failed.
  pub fn delay_for(&self, attempts: u32) -> chrono::Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    let delay = self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay);
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}

//! Retry budget and exponential backoff shared by all engines.

use std::time::Duration;

/// Failed deliveries allowed before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry policy: `delay = min(base * 2^attempt, ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a message goes to the DLQ
    pub max_attempts: u32,
    /// Base backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay,
            max_delay,
        }
    }

    /// Set the attempt budget (at least 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff before redelivering a message that has failed `attempt` times
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Whether a message with this attempt count has used up its budget
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        // 500ms, 1s, 2s, 4s, 8s, 16s, 30s (max)
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_saturates_on_large_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));

        let strict = policy.with_max_attempts(0);
        assert_eq!(strict.max_attempts, 1);
        assert!(strict.is_exhausted(1));
    }
}

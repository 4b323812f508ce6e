//! Session configuration.

use std::time::Duration;

/// Configuration of one repository session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// User the session authenticates as.
    pub user_id: String,
    /// Repository name.
    pub repository_name: String,
    /// Per-call timeout for blocking round trips.
    pub timeout: Duration,
    /// Default timeout when waiting for locks.
    pub lock_timeout: Duration,
    /// Whether the repository keys locks by `(object, branch)`.
    pub supports_branching: bool,
    /// Retry policy for idempotent calls.
    pub retry: RetryConfig,
}

impl SessionConfig {
    /// Creates a session configuration.
    pub fn new(user_id: impl Into<String>, repository_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            repository_name: repository_name.into(),
            timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
            supports_branching: true,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether locks are keyed per branch.
    pub fn with_branching(mut self, supports_branching: bool) -> Self {
        self.supports_branching = supports_branching;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("anonymous", "repo")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new("alice", "main-repo")
            .with_timeout(Duration::from_secs(5))
            .with_lock_timeout(Duration::from_millis(200))
            .with_branching(false);

        assert_eq!(config.user_id, "alice");
        assert_eq!(config.repository_name, "main-repo");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.lock_timeout, Duration::from_millis(200));
        assert!(!config.supports_branching);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}

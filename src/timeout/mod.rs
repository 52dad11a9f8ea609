//! Timeout and retry-backoff configuration.
//!
//! This module provides the timing knobs for agent execution: per-task and
//! per-agent deadlines, the fast-check deadline, and how long to wait
//! between retry attempts depending on how the failure was classified.

use std::time::Duration;

use crate::error::ErrorCategory;

/// Configuration for timeout and backoff behavior during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for a single parallel task execution.
    /// Default: 300 seconds (5 minutes)
    pub task_timeout: Duration,

    /// Maximum time allowed for a single pipeline agent invocation.
    /// Grows by `retry_timeout_increment` on each retry attempt.
    /// Default: 600 seconds (10 minutes)
    pub agent_timeout: Duration,

    /// Maximum time allowed for a fast validation check.
    /// Default: 60 seconds
    pub check_timeout: Duration,

    /// Added to the agent timeout on each retry attempt.
    /// Default: 30 seconds
    pub retry_timeout_increment: Duration,

    /// Wait before retrying a rate-limit-classified failure.
    /// Default: 30 seconds
    pub rate_limit_backoff: Duration,

    /// Wait before retrying a timeout-classified failure.
    /// Default: 10 seconds
    pub timeout_backoff: Duration,

    /// Wait before retrying any other failure.
    /// Default: 2 seconds
    pub other_backoff: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            agent_timeout: Duration::from_secs(600),
            check_timeout: Duration::from_secs(60),
            retry_timeout_increment: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(30),
            timeout_backoff: Duration::from_secs(10),
            other_backoff: Duration::from_secs(2),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-task execution timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the per-agent invocation timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Sets the fast validation check timeout.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Sets the per-retry timeout increment for agent invocations.
    pub fn with_retry_timeout_increment(mut self, increment: Duration) -> Self {
        self.retry_timeout_increment = increment;
        self
    }

    /// Agent timeout for a given attempt (1-based). Each retry gets a
    /// longer deadline than the one before it.
    pub fn agent_timeout_for_attempt(&self, attempt: u32) -> Duration {
        self.agent_timeout + self.retry_timeout_increment * attempt.saturating_sub(1)
    }

    /// Backoff to wait before retrying a failure of the given category.
    pub fn retry_backoff(&self, category: ErrorCategory) -> Duration {
        match category {
            ErrorCategory::RateLimit => self.rate_limit_backoff,
            ErrorCategory::Timeout => self.timeout_backoff,
            ErrorCategory::Other => self.other_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_task_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_default_agent_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.agent_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_default_check_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.check_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_new_returns_default() {
        assert_eq!(TimeoutConfig::new(), TimeoutConfig::default());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TimeoutConfig::new()
            .with_task_timeout(Duration::from_secs(120))
            .with_agent_timeout(Duration::from_secs(240))
            .with_check_timeout(Duration::from_secs(15))
            .with_retry_timeout_increment(Duration::from_secs(5));

        assert_eq!(config.task_timeout, Duration::from_secs(120));
        assert_eq!(config.agent_timeout, Duration::from_secs(240));
        assert_eq!(config.check_timeout, Duration::from_secs(15));
        assert_eq!(config.retry_timeout_increment, Duration::from_secs(5));
    }

    #[test]
    fn test_agent_timeout_grows_per_attempt() {
        let config = TimeoutConfig::default();
        assert_eq!(
            config.agent_timeout_for_attempt(1),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.agent_timeout_for_attempt(2),
            Duration::from_secs(630)
        );
        assert_eq!(
            config.agent_timeout_for_attempt(3),
            Duration::from_secs(660)
        );
    }

    #[test]
    fn test_backoff_ordering_by_category() {
        let config = TimeoutConfig::default();
        let rate_limit = config.retry_backoff(ErrorCategory::RateLimit);
        let timeout = config.retry_backoff(ErrorCategory::Timeout);
        let other = config.retry_backoff(ErrorCategory::Other);
        assert!(rate_limit > timeout);
        assert!(timeout > other);
    }
}

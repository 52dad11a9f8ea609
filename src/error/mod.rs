//! Error types and failure classification for the orchestrator.
//!
//! Agent failures are classified by message pattern into categories that
//! drive retry backoff: rate-limited calls wait longest, timeouts wait a
//! middle amount, everything else retries quickly.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during orchestration.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The external agent executor returned an error.
    #[error("agent '{agent_id}' failed: {message}")]
    AgentFailed { agent_id: String, message: String },

    /// A task exceeded its execution timeout.
    #[error("task '{task_id}' timed out after {timeout:?}")]
    TaskTimeout { task_id: String, timeout: Duration },

    /// A required pipeline phase failed with no remaining recovery path.
    #[error("phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    /// A referenced job does not exist in the store.
    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// A referenced task does not exist in the store.
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// IO error during checkpoint or recovery persistence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A spawned task panicked or was aborted.
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Category of an agent failure, derived from its message.
///
/// Categories are ordered by how patiently the caller should retry:
/// `RateLimit` backs off longest, `Timeout` a middle amount, `Other`
/// shortest. `Other` covers logical failures that a retry may or may not
/// help with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The upstream provider rejected the call for quota/rate reasons.
    RateLimit,
    /// The call exceeded a deadline.
    Timeout,
    /// Anything else.
    Other,
}

impl ErrorCategory {
    /// Stable label for logs and persisted records.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Other => "other",
        }
    }
}

/// Classify an error message into a retry category.
///
/// Pure and deterministic: the same message always yields the same
/// category.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("quota")
        || lower.contains("overloaded")
    {
        ErrorCategory::RateLimit
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else {
        ErrorCategory::Other
    }
}

impl OrchestratorError {
    /// Classify this error for retry backoff selection.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            OrchestratorError::TaskTimeout { .. } => ErrorCategory::Timeout,
            OrchestratorError::AgentFailed { message, .. } => classify_message(message),
            other => classify_message(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_messages() {
        assert_eq!(
            classify_message("429 Too Many Requests"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify_message("provider rate limit exceeded"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify_message("monthly quota exhausted"),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn test_classify_timeout_messages() {
        assert_eq!(
            classify_message("request timed out after 30s"),
            ErrorCategory::Timeout
        );
        assert_eq!(classify_message("connect timeout"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_classify_other_messages() {
        assert_eq!(
            classify_message("model returned malformed output"),
            ErrorCategory::Other
        );
        assert_eq!(classify_message(""), ErrorCategory::Other);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let msg = "rate limit hit, also timed out";
        let first = classify_message(msg);
        for _ in 0..10 {
            assert_eq!(classify_message(msg), first);
        }
        // Rate limit wins when both patterns are present.
        assert_eq!(first, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_task_timeout_classifies_as_timeout() {
        let err = OrchestratorError::TaskTimeout {
            task_id: "task-1".to_string(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.classify(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_agent_failed_classifies_by_message() {
        let err = OrchestratorError::AgentFailed {
            agent_id: "backend".to_string(),
            message: "429 too many requests".to_string(),
        };
        assert_eq!(err.classify(), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_category_labels_are_stable() {
        assert_eq!(ErrorCategory::RateLimit.as_label(), "rate_limit");
        assert_eq!(ErrorCategory::Timeout.as_label(), "timeout");
        assert_eq!(ErrorCategory::Other.as_label(), "other");
    }
}

//! Incremental validation after each unit of work.
//!
//! After a task modifies files, a fast check runs against the project.
//! Errors enter a bounded fix-and-recheck loop through the external fixer
//! capability; the loop stops early when a fixer pass makes no progress
//! (two consecutive identical error sets) so a looping fixer cannot burn
//! the full attempt budget.
//!
//! The validator only reports. Whether a failed validation fails the
//! owning task is the caller's policy (`fail_on_validation_error`).

pub mod accumulated;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::agents::{group_errors_by_file, FastCheck, Fixer};
use crate::classify::parse_error_details;
use crate::store::records::{Severity, ValidationError};

pub use accumulated::{
    AccumulatedErrorStats, AccumulatedErrorTracker, BlockVerdict, ErrorTrend, TrackerConfig,
};

/// Configuration for the incremental validation loop.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Maximum number of fixer invocations per validation.
    /// Default: 3
    pub max_fix_attempts: u32,
    /// Deadline for a single fast-check run. A timed-out check degrades
    /// to a warning, not a hard failure.
    /// Default: 60 seconds
    pub check_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 3,
            check_timeout: Duration::from_secs(60),
        }
    }
}

/// What to validate after a task.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub task_id: String,
    pub files_modified: Vec<String>,
    pub project_path: PathBuf,
}

/// Outcome of one incremental validation, including the number of fixer
/// attempts actually spent (reported accurately even on failure, since it
/// feeds trend analysis).
#[derive(Debug, Clone, Default)]
pub struct IncrementalValidationResult {
    pub passed: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
    pub fix_attempts: u32,
    /// Initially observed errors that the fix loop resolved.
    pub errors_fixed: usize,
    pub duration: Duration,
    pub files_checked: usize,
}

enum CheckOutcome {
    Diagnostics(Vec<ValidationError>),
    TimedOut,
    Failed(String),
}

/// Drives the fast-check plus bounded fix loop for one task.
pub struct IncrementalValidator {
    check: Arc<dyn FastCheck>,
    fixer: Arc<dyn Fixer>,
    config: ValidationConfig,
}

impl IncrementalValidator {
    pub fn new(check: Arc<dyn FastCheck>, fixer: Arc<dyn Fixer>, config: ValidationConfig) -> Self {
        Self {
            check,
            fixer,
            config,
        }
    }

    /// Validate the project after a task's changes.
    pub async fn validate_after_task(
        &self,
        request: &ValidationRequest,
    ) -> IncrementalValidationResult {
        let started = Instant::now();
        let mut result = IncrementalValidationResult {
            files_checked: request.files_modified.len(),
            ..IncrementalValidationResult::default()
        };

        let (mut errors, mut warnings) = match self.run_check(request).await {
            CheckOutcome::Diagnostics(diagnostics) => split_by_severity(diagnostics),
            CheckOutcome::TimedOut => {
                result.warnings.push(check_warning(
                    "check_timeout",
                    format!("fast check timed out after {:?}", self.config.check_timeout),
                ));
                result.passed = true;
                result.duration = started.elapsed();
                return result;
            }
            CheckOutcome::Failed(message) => {
                result.warnings.push(check_warning("check_failed", message));
                result.passed = true;
                result.duration = started.elapsed();
                return result;
            }
        };

        if errors.is_empty() {
            result.passed = true;
            result.warnings.append(&mut warnings);
            result.duration = started.elapsed();
            return result;
        }

        let initial_error_count = errors.len();
        let mut previous_signatures = signatures(&errors);

        while result.fix_attempts < self.config.max_fix_attempts {
            result.fix_attempts += 1;
            tracing::debug!(
                task_id = %request.task_id,
                attempt = result.fix_attempts,
                errors = errors.len(),
                "invoking fixer"
            );

            let grouped = group_errors_by_file(&errors);
            let (_cancel_tx, cancel_rx) = watch::channel(false);
            if let Err(err) = self
                .fixer
                .fix(&request.project_path, &grouped, cancel_rx)
                .await
            {
                tracing::warn!(task_id = %request.task_id, error = %err, "fixer invocation failed");
                break;
            }

            match self.run_check(request).await {
                CheckOutcome::Diagnostics(diagnostics) => {
                    let (new_errors, mut new_warnings) = split_by_severity(diagnostics);
                    warnings.append(&mut new_warnings);
                    if new_errors.is_empty() {
                        errors = new_errors;
                        break;
                    }
                    let new_signatures = signatures(&new_errors);
                    if new_signatures == previous_signatures {
                        // No progress: same error set as before the fixer
                        // pass. Stop before exhausting the budget.
                        tracing::debug!(
                            task_id = %request.task_id,
                            "fixer made no progress, stopping early"
                        );
                        errors = new_errors;
                        break;
                    }
                    previous_signatures = new_signatures;
                    errors = new_errors;
                }
                CheckOutcome::TimedOut => {
                    warnings.push(check_warning(
                        "check_timeout",
                        format!("recheck timed out after {:?}", self.config.check_timeout),
                    ));
                    break;
                }
                CheckOutcome::Failed(message) => {
                    warnings.push(check_warning("check_failed", message));
                    break;
                }
            }
        }

        result.passed = errors.is_empty();
        result.errors_fixed = initial_error_count.saturating_sub(errors.len());
        result.errors = errors;
        result.warnings = warnings;
        result.duration = started.elapsed();
        result
    }

    async fn run_check(&self, request: &ValidationRequest) -> CheckOutcome {
        let check = self
            .check
            .run(&request.project_path, Some(&request.files_modified));
        match tokio::time::timeout(self.config.check_timeout, check).await {
            Ok(Ok(raw)) => CheckOutcome::Diagnostics(parse_error_details(&raw)),
            Ok(Err(err)) => CheckOutcome::Failed(err.to_string()),
            Err(_) => CheckOutcome::TimedOut,
        }
    }
}

fn split_by_severity(
    diagnostics: Vec<ValidationError>,
) -> (Vec<ValidationError>, Vec<ValidationError>) {
    diagnostics
        .into_iter()
        .partition(|d| d.severity == Severity::Error)
}

fn signatures(errors: &[ValidationError]) -> BTreeSet<(String, Option<u32>, String)> {
    errors.iter().map(ValidationError::signature).collect()
}

fn check_warning(code: &str, message: String) -> ValidationError {
    ValidationError {
        file: "unknown".to_string(),
        line: None,
        column: None,
        code: code.to_string(),
        message,
        severity: Severity::Warning,
    }
}

//! Accumulated error tracking across a job.
//!
//! Every validation result feeds this tracker. Even when each task
//! individually passed, a job that only got there by fixing many errors
//! along the way is flagged as unstable code generation rather than a
//! clean success: heavy fixing correlates with low-quality output that
//! happened to be patched into a passing state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::records::ValidationError;
use crate::validation::IncrementalValidationResult;

/// Thresholds for vetoing overall job success.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Whether accumulated issues can veto job success at all.
    pub block_on_accumulated_issues: bool,
    /// Veto when total warnings exceed this.
    pub max_accumulated_warnings: usize,
    /// Veto when total fix attempts spent across the job exceed this.
    pub max_flapping_errors: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            block_on_accumulated_issues: true,
            max_accumulated_warnings: 20,
            max_flapping_errors: 10,
        }
    }
}

/// Direction of recent validation error counts within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTrend {
    Improving,
    Stable,
    Worsening,
}

/// Snapshot of accumulated validation issues, recomputed on demand from
/// the recorded history (never independently persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatedErrorStats {
    pub total_warnings: usize,
    pub total_errors_fixed: usize,
    pub total_fix_attempts: u32,
    /// `(task_id, error_count)` of the noisiest task, if any errored.
    pub task_with_most_errors: Option<(String, usize)>,
    /// Warning counts keyed by diagnostic code.
    pub warnings_by_type: HashMap<String, usize>,
    pub error_trend: ErrorTrend,
}

/// Verdict of the accumulated-issues blocking policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl BlockVerdict {
    fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    fn block(reason: String) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
struct TaskValidationRecord {
    task_id: String,
    error_count: usize,
    fix_attempts: u32,
    errors_fixed: usize,
    warnings: Vec<ValidationError>,
}

/// Aggregates validation results across all tasks of one job.
#[derive(Debug, Default)]
pub struct AccumulatedErrorTracker {
    config: TrackerConfig,
    history: Vec<TaskValidationRecord>,
}

impl AccumulatedErrorTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
        }
    }

    /// Record one task's validation result.
    pub fn record_validation(&mut self, task_id: &str, result: &IncrementalValidationResult) {
        self.history.push(TaskValidationRecord {
            task_id: task_id.to_string(),
            error_count: result.errors.len(),
            fix_attempts: result.fix_attempts,
            errors_fixed: result.errors_fixed,
            warnings: result.warnings.clone(),
        });
    }

    /// Number of recorded validations.
    pub fn recorded(&self) -> usize {
        self.history.len()
    }

    /// Recompute the accumulated stats from the full history.
    pub fn stats(&self) -> AccumulatedErrorStats {
        let mut warnings_by_type: HashMap<String, usize> = HashMap::new();
        let mut total_warnings = 0usize;
        let mut total_fix_attempts = 0u32;
        let mut total_errors_fixed = 0usize;
        let mut task_with_most_errors: Option<(String, usize)> = None;

        for record in &self.history {
            total_warnings += record.warnings.len();
            total_fix_attempts += record.fix_attempts;
            total_errors_fixed += record.errors_fixed;
            for warning in &record.warnings {
                *warnings_by_type.entry(warning.code.clone()).or_default() += 1;
            }
            if record.error_count > 0 {
                let is_new_max = task_with_most_errors
                    .as_ref()
                    .map_or(true, |(_, max)| record.error_count > *max);
                if is_new_max {
                    task_with_most_errors = Some((record.task_id.clone(), record.error_count));
                }
            }
        }

        AccumulatedErrorStats {
            total_warnings,
            total_errors_fixed,
            total_fix_attempts,
            task_with_most_errors,
            warnings_by_type,
            error_trend: self.trend(),
        }
    }

    /// Trend of recent error counts: the mean of the last 3 recorded
    /// validations against the mean of the up-to-3 before them.
    /// Insufficient data is never reported as a trend.
    fn trend(&self) -> ErrorTrend {
        if self.history.len() < 3 {
            return ErrorTrend::Stable;
        }
        let recent_start = self.history.len() - 3;
        let earlier_start = recent_start.saturating_sub(3);
        let earlier = &self.history[earlier_start..recent_start];
        if earlier.is_empty() {
            return ErrorTrend::Stable;
        }

        let mean = |records: &[TaskValidationRecord]| {
            records.iter().map(|r| r.error_count).sum::<usize>() as f64 / records.len() as f64
        };
        let recent_mean = mean(&self.history[recent_start..]);
        let earlier_mean = mean(earlier);

        if recent_mean < earlier_mean * 0.7 {
            ErrorTrend::Improving
        } else if recent_mean > earlier_mean * 1.3 {
            ErrorTrend::Worsening
        } else {
            ErrorTrend::Stable
        }
    }

    /// Apply the blocking policy: veto overall success when accumulated
    /// warnings or fix attempts exceed their thresholds, even if every
    /// individual validation passed.
    pub fn should_block(&self) -> BlockVerdict {
        if !self.config.block_on_accumulated_issues {
            return BlockVerdict::allow();
        }
        let stats = self.stats();
        if stats.total_warnings > self.config.max_accumulated_warnings {
            return BlockVerdict::block(format!(
                "accumulated {} warnings (max {})",
                stats.total_warnings, self.config.max_accumulated_warnings
            ));
        }
        if stats.total_fix_attempts > self.config.max_flapping_errors {
            return BlockVerdict::block(format!(
                "spent {} fix attempts across the job (max {})",
                stats.total_fix_attempts, self.config.max_flapping_errors
            ));
        }
        BlockVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::Severity;

    fn warning(code: &str) -> ValidationError {
        ValidationError {
            file: "src/app.ts".to_string(),
            line: Some(1),
            column: None,
            code: code.to_string(),
            message: "warning".to_string(),
            severity: Severity::Warning,
        }
    }

    fn result(errors: usize, warnings: usize, fix_attempts: u32) -> IncrementalValidationResult {
        IncrementalValidationResult {
            passed: errors == 0,
            errors: (0..errors)
                .map(|i| ValidationError {
                    file: "src/app.ts".to_string(),
                    line: Some(i as u32),
                    column: None,
                    code: "TS2304".to_string(),
                    message: "error".to_string(),
                    severity: Severity::Error,
                })
                .collect(),
            warnings: (0..warnings).map(|_| warning("no-unused-vars")).collect(),
            fix_attempts,
            errors_fixed: 0,
            duration: std::time::Duration::ZERO,
            files_checked: 1,
        }
    }

    fn tracker() -> AccumulatedErrorTracker {
        AccumulatedErrorTracker::new(TrackerConfig::default())
    }

    #[test]
    fn test_trend_stable_under_three_records() {
        let mut tracker = tracker();
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Stable);

        tracker.record_validation("t1", &result(9, 0, 0));
        tracker.record_validation("t2", &result(9, 0, 0));
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Stable);
    }

    #[test]
    fn test_trend_stable_with_no_earlier_window() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker.record_validation(&format!("t{}", i), &result(9, 0, 0));
        }
        // Three records fill the recent window but leave nothing to
        // compare against.
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Stable);
    }

    #[test]
    fn test_trend_improving() {
        let mut tracker = tracker();
        for (i, errors) in [10, 10, 10, 2, 2, 2].iter().enumerate() {
            tracker.record_validation(&format!("t{}", i), &result(*errors, 0, 0));
        }
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Improving);
    }

    #[test]
    fn test_trend_worsening() {
        let mut tracker = tracker();
        for (i, errors) in [1, 1, 1, 5, 5, 5].iter().enumerate() {
            tracker.record_validation(&format!("t{}", i), &result(*errors, 0, 0));
        }
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Worsening);
    }

    #[test]
    fn test_trend_stable_within_band() {
        let mut tracker = tracker();
        for (i, errors) in [4, 4, 4, 4, 4, 4].iter().enumerate() {
            tracker.record_validation(&format!("t{}", i), &result(*errors, 0, 0));
        }
        assert_eq!(tracker.stats().error_trend, ErrorTrend::Stable);
    }

    #[test]
    fn test_blocks_on_warnings_even_when_all_passed() {
        let mut tracker = AccumulatedErrorTracker::new(TrackerConfig {
            max_accumulated_warnings: 5,
            ..TrackerConfig::default()
        });
        for i in 0..3 {
            tracker.record_validation(&format!("t{}", i), &result(0, 2, 0));
        }
        let verdict = tracker.should_block();
        assert!(verdict.blocked);
        assert!(verdict.reason.expect("reason").contains("6 warnings"));
    }

    #[test]
    fn test_blocks_on_flapping_fix_attempts() {
        let mut tracker = AccumulatedErrorTracker::new(TrackerConfig {
            max_flapping_errors: 4,
            ..TrackerConfig::default()
        });
        for i in 0..3 {
            tracker.record_validation(&format!("t{}", i), &result(0, 0, 2));
        }
        let verdict = tracker.should_block();
        assert!(verdict.blocked);
        assert!(verdict.reason.expect("reason").contains("fix attempts"));
    }

    #[test]
    fn test_blocking_disabled() {
        let mut tracker = AccumulatedErrorTracker::new(TrackerConfig {
            block_on_accumulated_issues: false,
            max_accumulated_warnings: 0,
            max_flapping_errors: 0,
        });
        tracker.record_validation("t1", &result(0, 50, 50));
        assert!(!tracker.should_block().blocked);
    }

    #[test]
    fn test_stats_aggregation() {
        let mut tracker = tracker();
        tracker.record_validation("t1", &result(3, 1, 2));
        tracker.record_validation("t2", &result(7, 2, 1));
        tracker.record_validation("t3", &result(0, 0, 0));

        let stats = tracker.stats();
        assert_eq!(stats.total_warnings, 3);
        assert_eq!(stats.total_fix_attempts, 3);
        assert_eq!(
            stats.task_with_most_errors,
            Some(("t2".to_string(), 7))
        );
        assert_eq!(stats.warnings_by_type["no-unused-vars"], 3);
    }
}

//! Persistent record types for jobs and tasks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    /// A terminal job cannot transition further; resuming it requires a
    /// fresh job unless explicitly reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// What kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AgentExecution,
    Validation,
    FixAttempt,
    BuildValidation,
}

/// Severity of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A structured diagnostic produced by the fast check or parsed out of a
/// failed task's error text. Not persisted independently; carried inside
/// `Task::error_details` and validation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationError {
    /// Identity used to compare error sets across fix attempts.
    pub fn signature(&self) -> (String, Option<u32>, String) {
        (self.file.clone(), self.line, self.code.clone())
    }
}

/// One end-to-end generation run for a project.
///
/// Exactly one non-terminal job should exist per project at a time; this
/// is a convention enforced by callers, not a unique constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    /// Always `round(100 * completed_tasks / total_tasks)`, recomputed
    /// from the task table, never advanced independently.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Opaque caller-supplied metadata.
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job for a project.
    pub fn new(project_id: impl Into<String>, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("job"),
            project_id: project_id.into(),
            status: JobStatus::Pending,
            current_phase: None,
            current_agent: None,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            progress: 0,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            metadata,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute progress from task counters.
    pub fn recompute_progress(&mut self) {
        self.progress = if self.total_tasks == 0 {
            0
        } else {
            ((self.completed_tasks as f64 / self.total_tasks as f64) * 100.0).round() as u8
        };
    }
}

/// One unit of work within a job, executed by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub project_id: String,
    pub phase: String,
    pub agent_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Lower value = more urgent.
    pub priority: i32,
    pub depends_on: Vec<String>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Vec<ValidationError>>,
    pub retry_count: u32,
    pub files_modified: Vec<String>,
    /// Set only at completion, computed from this task's own `started_at`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// DAG-readiness invariant: a task can start iff it is pending and
    /// every dependency id is in the completed set.
    pub fn can_start(&self, completed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Pending && self.depends_on.iter().all(|d| completed.contains(d))
    }
}

/// Options for creating a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub priority: i32,
    pub depends_on: Vec<String>,
    pub input: Option<Value>,
}

/// An implementation-phase unit of work produced by the task-breakdown
/// phase. Immutable once handed to the parallel executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentTask {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub files: Vec<String>,
    /// Lower value = more urgent.
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// The full implementation-phase breakdown handed to the parallel
/// executor: the task list plus optional pre-computed parallel groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub tasks: Vec<DevelopmentTask>,
    /// Pre-computed groups of task ids known to be safe to run together.
    /// Consumed ahead of the dependency scan when present.
    #[serde(default)]
    pub parallel_groups: Vec<Vec<String>>,
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique, sortable record id (`<prefix>-<millis>-<seq>`).
pub fn generate_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, millis, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_id_is_unique() {
        let a = generate_id("job");
        let b = generate_id("job");
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("proj-1", json!({"kind": "webapp"}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_recompute_progress_rounds() {
        let mut job = Job::new("proj-1", Value::Null);
        job.total_tasks = 3;
        job.completed_tasks = 1;
        job.recompute_progress();
        assert_eq!(job.progress, 33);

        job.completed_tasks = 2;
        job.recompute_progress();
        assert_eq!(job.progress, 67);
    }

    #[test]
    fn test_recompute_progress_zero_tasks() {
        let mut job = Job::new("proj-1", Value::Null);
        job.recompute_progress();
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_can_start_requires_pending_and_completed_deps() {
        let mut task = Task {
            id: "t2".to_string(),
            job_id: "j".to_string(),
            project_id: "p".to_string(),
            phase: "implementation".to_string(),
            agent_id: "backend".to_string(),
            task_type: TaskType::AgentExecution,
            status: TaskStatus::Pending,
            priority: 1,
            depends_on: vec!["t1".to_string()],
            input: Value::Null,
            output: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            files_modified: Vec::new(),
            duration_ms: None,
            started_at: None,
            completed_at: None,
        };

        let mut completed = HashSet::new();
        assert!(!task.can_start(&completed));

        completed.insert("t1".to_string());
        assert!(task.can_start(&completed));

        task.status = TaskStatus::Running;
        assert!(!task.can_start(&completed));
    }

    #[test]
    fn test_validation_error_signature_ignores_message() {
        let a = ValidationError {
            file: "src/app.ts".to_string(),
            line: Some(10),
            column: Some(4),
            code: "TS2304".to_string(),
            message: "Cannot find name 'foo'".to_string(),
            severity: Severity::Error,
        };
        let mut b = a.clone();
        b.message = "different wording".to_string();
        b.column = None;
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_task_breakdown_deserializes_with_defaults() {
        let breakdown: TaskBreakdown = serde_json::from_value(json!({
            "tasks": [
                {
                    "id": "dev-1",
                    "title": "Create login form",
                    "type": "frontend",
                    "files": ["src/Login.tsx"],
                    "priority": 1
                }
            ]
        }))
        .expect("deserialize");
        assert_eq!(breakdown.tasks.len(), 1);
        assert!(breakdown.tasks[0].dependencies.is_empty());
        assert!(breakdown.parallel_groups.is_empty());
    }
}

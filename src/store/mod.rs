//! Job and task state tracking.
//!
//! The store is the single source of truth for reads within the process.
//! Every mutation also schedules a fire-and-forget upsert to the durable
//! mirror: mirror failures are logged and never block or fail the
//! in-memory operation. Tests that need durability settled call
//! [`JobStore::sync`].
//!
//! Operations on a missing id return `None` rather than an error; callers
//! must handle absence.

pub mod mirror;
pub mod records;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::classify::AutoFixMatcher;
pub use mirror::{FileStateMirror, MirrorError, MirrorResult, NullStateMirror, StateMirror};
pub use records::{
    generate_id, CreateTaskOptions, DevelopmentTask, Job, JobStatus, Severity, Task,
    TaskBreakdown, TaskStatus, TaskType, ValidationError,
};

/// Partial update for a job. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub current_phase: Option<String>,
    pub current_agent: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    pub metadata: Option<Value>,
}

/// How a task finished.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub success: bool,
    pub output: Option<Value>,
    pub files_modified: Vec<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Vec<ValidationError>>,
}

impl TaskCompletion {
    /// Successful completion with an output payload and modified files.
    pub fn succeeded(output: Option<Value>, files_modified: Vec<String>) -> Self {
        Self {
            success: true,
            output,
            files_modified,
            ..Self::default()
        }
    }

    /// Failed completion with an error message and optional diagnostics.
    pub fn failed(
        error_message: impl Into<String>,
        error_details: Option<Vec<ValidationError>>,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            error_details,
            ..Self::default()
        }
    }
}

/// One classified error from a failed task.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub task_id: String,
    pub error: ValidationError,
    pub auto_fixable: bool,
}

/// Result of scanning a job's failed tasks.
#[derive(Debug, Clone, Default)]
pub struct ErrorAnalysis {
    /// Deduplicated errors across all failed tasks.
    pub errors: Vec<ClassifiedError>,
    /// True iff at least one error is auto-fixable.
    pub can_auto_fix: bool,
}

/// In-process job/task store with a best-effort durable mirror.
///
/// Records live behind per-record mutexes under outer read-mostly maps,
/// so concurrent task completions from a parallel batch never contend on
/// a whole-table write lock.
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
    /// Task ids per job, in creation order.
    job_tasks: RwLock<HashMap<String, Vec<String>>>,
    mirror: Arc<dyn StateMirror>,
    matcher: AutoFixMatcher,
    pending_mirror: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobStore {
    /// Store with no durability (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self::with_mirror(Arc::new(NullStateMirror))
    }

    /// Store mirrored to the given durable backing.
    pub fn with_mirror(mirror: Arc<dyn StateMirror>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            job_tasks: RwLock::new(HashMap::new()),
            mirror,
            matcher: AutoFixMatcher::default(),
            pending_mirror: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Replace the auto-fix matcher used by [`JobStore::analyze_errors`].
    pub fn with_matcher(mut self, matcher: AutoFixMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Seed the store from previously mirrored records (crash recovery).
    pub async fn restore(&self, jobs: Vec<Job>, tasks: Vec<Task>) {
        let mut job_map = self.jobs.write().await;
        let mut task_map = self.tasks.write().await;
        let mut index = self.job_tasks.write().await;
        for job in jobs {
            index.entry(job.id.clone()).or_default();
            job_map.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        }
        let mut tasks = tasks;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        for task in tasks {
            index
                .entry(task.job_id.clone())
                .or_default()
                .push(task.id.clone());
            task_map.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        }
    }

    /// Wait for every pending mirror write to settle. Production code
    /// never calls this; tests use it before asserting on the mirror.
    pub async fn sync(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending_mirror.lock().expect("pending mirror lock");
            pending.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn mirror_job(&self, job: Job) {
        let mirror = Arc::clone(&self.mirror);
        let handle = tokio::spawn(async move {
            if let Err(err) = mirror.upsert_job(&job).await {
                tracing::warn!(job_id = %job.id, error = %err, "job mirror upsert failed");
            }
        });
        self.track_mirror_write(handle);
    }

    fn mirror_task(&self, task: Task) {
        let mirror = Arc::clone(&self.mirror);
        let handle = tokio::spawn(async move {
            if let Err(err) = mirror.upsert_task(&task).await {
                tracing::warn!(task_id = %task.id, error = %err, "task mirror upsert failed");
            }
        });
        self.track_mirror_write(handle);
    }

    fn track_mirror_write(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending_mirror.lock().expect("pending mirror lock");
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    // ---- jobs ----

    /// Create a new pending job for a project.
    pub async fn create_job(&self, project_id: impl Into<String>, metadata: Value) -> Job {
        let job = Job::new(project_id, metadata);
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job.id.clone(), Arc::new(Mutex::new(job.clone())));
        }
        self.job_tasks
            .write()
            .await
            .insert(job.id.clone(), Vec::new());
        self.mirror_job(job.clone());
        job
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: &str) -> Option<Job> {
        let arc = self.jobs.read().await.get(id).cloned()?;
        let job = arc.lock().await.clone();
        Some(job)
    }

    /// Most recent non-terminal job for a project, if any.
    pub async fn get_job_by_project(&self, project_id: &str) -> Option<Job> {
        let arcs: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut newest: Option<Job> = None;
        for arc in arcs {
            let job = arc.lock().await.clone();
            if job.project_id == project_id && !job.status.is_terminal() {
                let is_newer = newest
                    .as_ref()
                    .map_or(true, |current| job.created_at > current.created_at);
                if is_newer {
                    newest = Some(job);
                }
            }
        }
        newest
    }

    /// Apply a partial update to a job.
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Option<Job> {
        let arc = self.jobs.read().await.get(id).cloned()?;
        let job = {
            let mut job = arc.lock().await;
            if let Some(status) = patch.status {
                job.status = status;
            }
            if let Some(phase) = patch.current_phase {
                job.current_phase = Some(phase);
            }
            if let Some(agent) = patch.current_agent {
                job.current_agent = Some(agent);
            }
            if let Some(message) = patch.error_message {
                job.error_message = Some(message);
            }
            if let Some(retries) = patch.retry_count {
                job.retry_count = retries;
            }
            if let Some(metadata) = patch.metadata {
                job.metadata = metadata;
            }
            job.updated_at = Utc::now();
            job.clone()
        };
        self.mirror_job(job.clone());
        Some(job)
    }

    /// Transition a job to running and stamp its start time.
    pub async fn start_job(&self, id: &str) -> Option<Job> {
        let arc = self.jobs.read().await.get(id).cloned()?;
        let job = {
            let mut job = arc.lock().await;
            job.status = JobStatus::Running;
            let now = Utc::now();
            job.started_at.get_or_insert(now);
            job.updated_at = now;
            job.clone()
        };
        self.mirror_job(job.clone());
        Some(job)
    }

    /// Transition a job to its terminal status.
    pub async fn complete_job(
        &self,
        id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> Option<Job> {
        let arc = self.jobs.read().await.get(id).cloned()?;
        let job = {
            let mut job = arc.lock().await;
            job.status = if success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            job.error_message = error_message;
            let now = Utc::now();
            job.completed_at = Some(now);
            job.updated_at = now;
            job.clone()
        };
        self.mirror_job(job.clone());
        Some(job)
    }

    /// Pause a running job.
    pub async fn pause_job(&self, id: &str) -> Option<Job> {
        self.update_job(
            id,
            JobPatch {
                status: Some(JobStatus::Paused),
                ..JobPatch::default()
            },
        )
        .await
    }

    /// Reopen a job and return it together with every task that is
    /// currently DAG-ready.
    pub async fn resume_job(&self, id: &str) -> Option<(Job, Vec<Task>)> {
        let job = self.update_job(
            id,
            JobPatch {
                status: Some(JobStatus::Running),
                ..JobPatch::default()
            },
        )
        .await?;
        let next_tasks = self.get_ready_tasks(id).await;
        Some((job, next_tasks))
    }

    // ---- tasks ----

    /// Create a task under a job. Returns `None` if the job is unknown.
    pub async fn create_task(
        &self,
        job_id: &str,
        project_id: &str,
        phase: &str,
        agent_id: &str,
        task_type: TaskType,
        options: CreateTaskOptions,
    ) -> Option<Task> {
        let job_arc = self.jobs.read().await.get(job_id).cloned()?;

        let task = Task {
            id: generate_id("task"),
            job_id: job_id.to_string(),
            project_id: project_id.to_string(),
            phase: phase.to_string(),
            agent_id: agent_id.to_string(),
            task_type,
            status: TaskStatus::Pending,
            priority: options.priority,
            depends_on: options.depends_on,
            input: options.input.unwrap_or(Value::Null),
            output: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            files_modified: Vec::new(),
            duration_ms: None,
            started_at: None,
            completed_at: None,
        };

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        }
        self.job_tasks
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(task.id.clone());

        let job = {
            let mut job = job_arc.lock().await;
            job.total_tasks += 1;
            job.recompute_progress();
            job.updated_at = Utc::now();
            job.clone()
        };

        self.mirror_task(task.clone());
        self.mirror_job(job);
        Some(task)
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        let arc = self.tasks.read().await.get(id).cloned()?;
        let task = arc.lock().await.clone();
        Some(task)
    }

    /// Transition a task to running and stamp its start time.
    pub async fn start_task(&self, id: &str) -> Option<Task> {
        let arc = self.tasks.read().await.get(id).cloned()?;
        let task = {
            let mut task = arc.lock().await;
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };
        self.mirror_task(task.clone());
        Some(task)
    }

    /// Mark a pending task skipped (its batch never ran).
    pub async fn skip_task(&self, id: &str) -> Option<Task> {
        let arc = self.tasks.read().await.get(id).cloned()?;
        let task = {
            let mut task = arc.lock().await;
            task.status = TaskStatus::Skipped;
            task.completed_at = Some(Utc::now());
            task.clone()
        };
        self.mirror_task(task.clone());
        Some(task)
    }

    /// Complete a task and recompute its job's counters and progress from
    /// the task table in the same logical step.
    pub async fn complete_task(&self, id: &str, completion: TaskCompletion) -> Option<Task> {
        let arc = self.tasks.read().await.get(id).cloned()?;
        let task = {
            let mut task = arc.lock().await;
            task.status = if completion.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            let now = Utc::now();
            // Duration derives from this task's own start, never inherited.
            task.duration_ms = task
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
            task.completed_at = Some(now);
            task.output = completion.output;
            if !completion.files_modified.is_empty() {
                task.files_modified = completion.files_modified;
            }
            task.error_message = completion.error_message;
            task.error_details = completion.error_details;
            task.clone()
        };

        let job = self.recompute_job_counters(&task.job_id).await;

        self.mirror_task(task.clone());
        if let Some(job) = job {
            self.mirror_job(job);
        }
        Some(task)
    }

    /// Recompute a job's completed/failed counters and progress by
    /// scanning its tasks. The job mutex is held across the scan so two
    /// concurrent task completions cannot interleave a stale counter
    /// write.
    async fn recompute_job_counters(&self, job_id: &str) -> Option<Job> {
        let job_arc = self.jobs.read().await.get(job_id).cloned()?;
        let task_ids = self
            .job_tasks
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        let task_arcs: Vec<Arc<Mutex<Task>>> = {
            let tasks = self.tasks.read().await;
            task_ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
        };

        let mut job = job_arc.lock().await;
        let mut completed = 0u32;
        let mut failed = 0u32;
        for task_arc in &task_arcs {
            match task_arc.lock().await.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                _ => {}
            }
        }
        job.completed_tasks = completed;
        job.failed_tasks = failed;
        job.recompute_progress();
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    /// All tasks belonging to a job, in creation order.
    pub async fn get_tasks_by_job(&self, job_id: &str) -> Vec<Task> {
        let task_ids = self
            .job_tasks
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        let mut result = Vec::with_capacity(task_ids.len());
        let tasks = self.tasks.read().await;
        for id in task_ids {
            if let Some(arc) = tasks.get(&id) {
                result.push(arc.lock().await.clone());
            }
        }
        result
    }

    /// Tasks of a job restricted to one phase.
    pub async fn get_tasks_by_phase(&self, job_id: &str, phase: &str) -> Vec<Task> {
        self.get_tasks_by_job(job_id)
            .await
            .into_iter()
            .filter(|t| t.phase == phase)
            .collect()
    }

    /// Failed tasks of a job.
    pub async fn get_failed_tasks(&self, job_id: &str) -> Vec<Task> {
        self.get_tasks_by_job(job_id)
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// Pending tasks whose dependencies are all completed.
    pub async fn get_ready_tasks(&self, job_id: &str) -> Vec<Task> {
        let tasks = self.get_tasks_by_job(job_id).await;
        let completed: HashSet<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        tasks
            .into_iter()
            .filter(|t| t.can_start(&completed))
            .collect()
    }

    // ---- error analysis ----

    /// Scan a job's failed tasks and return a deduplicated, classified
    /// error list. `can_auto_fix` is true iff at least one error matches
    /// a mechanical defect class.
    pub async fn analyze_errors(&self, job_id: &str) -> ErrorAnalysis {
        let failed = self.get_failed_tasks(job_id).await;
        let mut seen: HashSet<(String, Option<u32>, String, String)> = HashSet::new();
        let mut analysis = ErrorAnalysis::default();

        for task in failed {
            let errors = match (&task.error_details, &task.error_message) {
                (Some(details), _) if !details.is_empty() => details.clone(),
                (_, Some(message)) => vec![ValidationError {
                    file: "unknown".to_string(),
                    line: None,
                    column: None,
                    code: "raw".to_string(),
                    message: message.clone(),
                    severity: Severity::Error,
                }],
                _ => Vec::new(),
            };

            for error in errors {
                let key = (
                    error.file.clone(),
                    error.line,
                    error.code.clone(),
                    error.message.clone(),
                );
                if !seen.insert(key) {
                    continue;
                }
                let auto_fixable = self.matcher.is_auto_fixable(&error.message);
                analysis.can_auto_fix |= auto_fixable;
                analysis.errors.push(ClassifiedError {
                    task_id: task.id.clone(),
                    error,
                    auto_fixable,
                });
            }
        }
        analysis
    }

    /// Materialize a high-priority, dependency-free fix task bound to a
    /// failed task's errors. Returns `None` if the failed task is unknown.
    pub async fn create_fix_task(&self, failed_task_id: &str) -> Option<Task> {
        let failed = self.get_task(failed_task_id).await?;
        let input = json!({
            "failed_task_id": failed.id,
            "error_message": failed.error_message,
            "errors": failed.error_details,
        });
        self.create_task(
            &failed.job_id,
            &failed.project_id,
            &failed.phase,
            &failed.agent_id,
            TaskType::FixAttempt,
            CreateTaskOptions {
                priority: 0,
                depends_on: Vec::new(),
                input: Some(input),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::in_memory()
    }

    async fn job_with_tasks(store: &JobStore, count: usize) -> (Job, Vec<Task>) {
        let job = store.create_job("proj-1", Value::Null).await;
        let mut tasks = Vec::new();
        for _ in 0..count {
            let task = store
                .create_task(
                    &job.id,
                    "proj-1",
                    "implementation",
                    "backend",
                    TaskType::AgentExecution,
                    CreateTaskOptions::default(),
                )
                .await
                .expect("create task");
            tasks.push(task);
        }
        (job, tasks)
    }

    #[tokio::test]
    async fn test_missing_ids_return_none() {
        let store = store();
        assert!(store.get_job("nope").await.is_none());
        assert!(store.get_task("nope").await.is_none());
        assert!(store.start_job("nope").await.is_none());
        assert!(store
            .complete_task("nope", TaskCompletion::succeeded(None, Vec::new()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_progress_recomputed_on_each_completion() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 3).await;

        store.start_task(&tasks[0].id).await;
        store
            .complete_task(&tasks[0].id, TaskCompletion::succeeded(None, Vec::new()))
            .await;
        let job_after = store.get_job(&job.id).await.expect("job");
        assert_eq!(job_after.completed_tasks, 1);
        assert_eq!(job_after.progress, 33);

        store.start_task(&tasks[1].id).await;
        store
            .complete_task(&tasks[1].id, TaskCompletion::failed("boom", None))
            .await;
        let job_after = store.get_job(&job.id).await.expect("job");
        assert_eq!(job_after.failed_tasks, 1);
        assert_eq!(job_after.progress, 33);

        store.start_task(&tasks[2].id).await;
        store
            .complete_task(&tasks[2].id, TaskCompletion::succeeded(None, Vec::new()))
            .await;
        let job_after = store.get_job(&job.id).await.expect("job");
        assert_eq!(job_after.completed_tasks, 2);
        assert_eq!(job_after.progress, 67);
    }

    #[tokio::test]
    async fn test_duration_from_own_started_at() {
        let store = store();
        let (_, tasks) = job_with_tasks(&store, 1).await;

        // Never started: no duration even at completion.
        let done = store
            .complete_task(&tasks[0].id, TaskCompletion::succeeded(None, Vec::new()))
            .await
            .expect("complete");
        assert!(done.duration_ms.is_none());
    }

    #[tokio::test]
    async fn test_ready_tasks_respect_dag() {
        let store = store();
        let job = store.create_job("proj-1", Value::Null).await;
        let a = store
            .create_task(
                &job.id,
                "proj-1",
                "implementation",
                "backend",
                TaskType::AgentExecution,
                CreateTaskOptions::default(),
            )
            .await
            .expect("task a");
        let b = store
            .create_task(
                &job.id,
                "proj-1",
                "implementation",
                "backend",
                TaskType::AgentExecution,
                CreateTaskOptions {
                    depends_on: vec![a.id.clone()],
                    ..CreateTaskOptions::default()
                },
            )
            .await
            .expect("task b");

        let ready: Vec<String> = store
            .get_ready_tasks(&job.id)
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![a.id.clone()]);

        store.start_task(&a.id).await;
        store
            .complete_task(&a.id, TaskCompletion::succeeded(None, Vec::new()))
            .await;

        let ready: Vec<String> = store
            .get_ready_tasks(&job.id)
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![b.id]);
    }

    #[tokio::test]
    async fn test_get_job_by_project_skips_terminal() {
        let store = store();
        let old = store.create_job("proj-1", Value::Null).await;
        store.complete_job(&old.id, true, None).await;
        let newer = store.create_job("proj-1", Value::Null).await;

        let found = store.get_job_by_project("proj-1").await.expect("job");
        assert_eq!(found.id, newer.id);

        store.complete_job(&newer.id, false, Some("fail".into())).await;
        assert!(store.get_job_by_project("proj-1").await.is_none());
    }

    #[tokio::test]
    async fn test_resume_job_returns_ready_tasks() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 2).await;
        store.pause_job(&job.id).await;

        let (resumed, next) = store.resume_job(&job.id).await.expect("resume");
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(next.len(), tasks.len());
    }

    #[tokio::test]
    async fn test_analyze_errors_dedups_and_classifies() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 2).await;

        let fixable = ValidationError {
            file: "src/app.ts".to_string(),
            line: Some(3),
            column: None,
            code: "TS2304".to_string(),
            message: "Cannot find name 'foo'".to_string(),
            severity: Severity::Error,
        };
        store
            .complete_task(
                &tasks[0].id,
                TaskCompletion::failed("typecheck failed", Some(vec![fixable.clone()])),
            )
            .await;
        // Same diagnostic from a second task: deduplicated.
        store
            .complete_task(
                &tasks[1].id,
                TaskCompletion::failed("typecheck failed", Some(vec![fixable])),
            )
            .await;

        let analysis = store.analyze_errors(&job.id).await;
        assert_eq!(analysis.errors.len(), 1);
        assert!(analysis.can_auto_fix);
        assert!(analysis.errors[0].auto_fixable);
    }

    #[tokio::test]
    async fn test_analyze_errors_non_fixable_message() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 1).await;
        store
            .complete_task(
                &tasks[0].id,
                TaskCompletion::failed("ECONNREFUSED 127.0.0.1:5432", None),
            )
            .await;

        let analysis = store.analyze_errors(&job.id).await;
        assert_eq!(analysis.errors.len(), 1);
        assert!(!analysis.can_auto_fix);
        assert_eq!(analysis.errors[0].error.code, "raw");
    }

    #[tokio::test]
    async fn test_create_fix_task_is_urgent_and_free() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 1).await;
        store
            .complete_task(&tasks[0].id, TaskCompletion::failed("boom", None))
            .await;

        let fix = store.create_fix_task(&tasks[0].id).await.expect("fix task");
        assert_eq!(fix.task_type, TaskType::FixAttempt);
        assert_eq!(fix.priority, 0);
        assert!(fix.depends_on.is_empty());
        assert_eq!(fix.job_id, job.id);
        assert_eq!(fix.input["failed_task_id"], tasks[0].id.as_str());
    }

    #[tokio::test]
    async fn test_mirror_receives_upserts() {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let mirror = Arc::new(FileStateMirror::new(temp_dir.path()).expect("mirror"));
        let store = JobStore::with_mirror(mirror.clone());

        let job = store.create_job("proj-1", Value::Null).await;
        let task = store
            .create_task(
                &job.id,
                "proj-1",
                "analysis",
                "analyst",
                TaskType::AgentExecution,
                CreateTaskOptions::default(),
            )
            .await
            .expect("task");
        store.sync().await;

        let jobs = mirror.load_jobs().expect("load jobs");
        let tasks = mirror.load_tasks().expect("load tasks");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task.id);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_indexes() {
        let store = store();
        let (job, tasks) = job_with_tasks(&store, 2).await;
        let all_tasks = store.get_tasks_by_job(&job.id).await;
        let job_record = store.get_job(&job.id).await.expect("job");

        let fresh = JobStore::in_memory();
        fresh.restore(vec![job_record], all_tasks).await;
        assert_eq!(fresh.get_tasks_by_job(&job.id).await.len(), tasks.len());
        assert!(fresh.get_job(&job.id).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_completions_keep_counters_exact() {
        let store = Arc::new(store());
        let (job, tasks) = job_with_tasks(&store, 8).await;

        let mut handles = Vec::new();
        for task in &tasks {
            let store = Arc::clone(&store);
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store.start_task(&id).await;
                store
                    .complete_task(&id, TaskCompletion::succeeded(None, Vec::new()))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let job_after = store.get_job(&job.id).await.expect("job");
        assert_eq!(job_after.completed_tasks, 8);
        assert_eq!(job_after.progress, 100);
    }
}

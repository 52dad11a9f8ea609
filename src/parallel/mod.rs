//! Dependency-aware parallel execution of implementation tasks.
//!
//! Batches run strictly sequentially. Within a batch, tasks run in
//! fixed-size chunks of `max_concurrent_agents`; each task execution is
//! wrapped in a timeout backed by a cooperative cancellation signal, so
//! an expired task is told to stop and marked failed without disturbing
//! its neighbours. Per-task results travel back through each spawned
//! handle's own slot and are folded by the single driver task, so no
//! shared collection is ever appended to concurrently.

pub mod batches;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use tokio::sync::watch;

use crate::agents::{AgentContext, AgentDefinition, AgentExecutor, ProgressSink};
use crate::error::OrchestratorError;
use crate::store::records::{CreateTaskOptions, DevelopmentTask, TaskBreakdown, TaskType};
use crate::store::{JobStore, TaskCompletion};
use crate::timeout::TimeoutConfig;
use crate::validation::{
    AccumulatedErrorStats, AccumulatedErrorTracker, IncrementalValidationResult,
    IncrementalValidator, TrackerConfig, ValidationRequest,
};

pub use batches::ExecutionPlan;

/// Configuration for parallel task execution.
#[derive(Debug, Clone)]
pub struct ParallelExecutorConfig {
    /// Maximum tasks executing concurrently within a batch.
    /// Default: 3
    pub max_concurrent_agents: usize,
    /// Whether a failed batch halts subsequent batches.
    /// Default: false (halt)
    pub continue_on_task_failure: bool,
    /// Whether a failed validation fails the owning task.
    /// Default: true
    pub fail_on_validation_error: bool,
    /// Timeout settings (per-task deadline, check deadline).
    pub timeouts: TimeoutConfig,
    /// Accumulated-issue thresholds.
    pub tracker: TrackerConfig,
}

impl Default for ParallelExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 3,
            continue_on_task_failure: false,
            fail_on_validation_error: true,
            timeouts: TimeoutConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Where a parallel execution runs: the owning job and project.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub project_id: String,
    pub project_path: std::path::PathBuf,
}

/// Summary of one executed batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub index: usize,
    pub task_ids: Vec<String>,
    pub succeeded: bool,
    pub duration: Duration,
}

/// One failed task with enough context to distinguish a timeout from a
/// logical failure.
#[derive(Debug, Clone)]
pub struct FailedTask {
    /// Store task id.
    pub task_id: String,
    /// Development task id from the breakdown.
    pub dev_task_id: String,
    pub error: String,
    pub timed_out: bool,
}

/// Outcome of executing a full breakdown.
#[derive(Debug, Clone)]
pub struct ParallelExecutionResult {
    /// No failed tasks and not blocked by accumulated issues.
    pub success: bool,
    pub batches: Vec<BatchResult>,
    pub total_files_modified: Vec<String>,
    pub failed_tasks: Vec<FailedTask>,
    pub accumulated_stats: AccumulatedErrorStats,
    pub blocked_by_accumulated_issues: bool,
    /// Reason for the veto, when blocked.
    pub block_reason: Option<String>,
    pub duration: Duration,
}

/// Per-slot result returned from each spawned task execution.
struct TaskRunOutcome {
    task_id: String,
    dev_task_id: String,
    success: bool,
    timed_out: bool,
    error: Option<String>,
    files_modified: Vec<String>,
    validation: Option<IncrementalValidationResult>,
}

/// Executes a task breakdown as concurrency-safe waves.
pub struct ParallelTaskExecutor {
    store: Arc<JobStore>,
    executor: Arc<dyn AgentExecutor>,
    validator: Arc<IncrementalValidator>,
    sink: Arc<dyn ProgressSink>,
    config: ParallelExecutorConfig,
}

impl ParallelTaskExecutor {
    pub fn new(
        store: Arc<JobStore>,
        executor: Arc<dyn AgentExecutor>,
        validator: Arc<IncrementalValidator>,
        sink: Arc<dyn ProgressSink>,
        config: ParallelExecutorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            validator,
            sink,
            config,
        }
    }

    /// Execute every task in the breakdown, batch by batch.
    pub async fn execute(
        &self,
        context: &ExecutionContext,
        breakdown: &TaskBreakdown,
    ) -> ParallelExecutionResult {
        let started = Instant::now();
        let plan = ExecutionPlan::analyze(breakdown);
        tracing::info!(
            job_id = %context.job_id,
            tasks = plan.task_count(),
            batches = plan.batches.len(),
            "starting parallel implementation"
        );

        let mut tracker = AccumulatedErrorTracker::new(self.config.tracker.clone());
        let mut batch_results: Vec<BatchResult> = Vec::new();
        let mut failed_tasks: Vec<FailedTask> = Vec::new();
        let mut total_files_modified: Vec<String> = Vec::new();
        // Development-task id -> store-task id, filled as batches finish,
        // so later tasks persist their dependencies as real store ids.
        let mut dev_to_store: HashMap<String, String> = HashMap::new();
        let mut halted = false;

        for (index, batch) in plan.batches.iter().enumerate() {
            if halted {
                self.skip_batch(context, batch, &mut dev_to_store).await;
                continue;
            }

            let batch_started = Instant::now();
            let mut batch_task_ids: Vec<String> = Vec::new();
            let mut batch_succeeded = true;

            for chunk in batch.chunks(self.config.max_concurrent_agents.max(1)) {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|dev_task| {
                        let depends_on = resolve_dependencies(dev_task, &dev_to_store);
                        tokio::spawn(run_one_task(
                            Arc::clone(&self.store),
                            Arc::clone(&self.executor),
                            Arc::clone(&self.validator),
                            Arc::clone(&self.sink),
                            self.config.clone(),
                            context.clone(),
                            dev_task.clone(),
                            depends_on,
                        ))
                    })
                    .collect();

                // Fold each slot's outcome on this single driver task.
                for joined in join_all(handles).await {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::error!(error = %err, "task execution panicked");
                            batch_succeeded = false;
                            continue;
                        }
                    };

                    // An empty task id means no store record was ever
                    // created (the owning job vanished); there is nothing
                    // to account against.
                    if !outcome.task_id.is_empty() {
                        dev_to_store
                            .insert(outcome.dev_task_id.clone(), outcome.task_id.clone());
                        batch_task_ids.push(outcome.task_id.clone());
                    }
                    total_files_modified.extend(outcome.files_modified.iter().cloned());
                    if let Some(validation) = &outcome.validation {
                        tracker.record_validation(&outcome.task_id, validation);
                    }
                    if !outcome.success {
                        batch_succeeded = false;
                        failed_tasks.push(FailedTask {
                            task_id: outcome.task_id,
                            dev_task_id: outcome.dev_task_id,
                            error: outcome
                                .error
                                .unwrap_or_else(|| "unknown error".to_string()),
                            timed_out: outcome.timed_out,
                        });
                    }
                }
            }

            batch_results.push(BatchResult {
                index,
                task_ids: batch_task_ids,
                succeeded: batch_succeeded,
                duration: batch_started.elapsed(),
            });
            self.sink.emit(
                &context.project_id,
                "batch:completed",
                json!({ "index": index, "succeeded": batch_succeeded }),
            );

            if !batch_succeeded && !self.config.continue_on_task_failure {
                tracing::warn!(batch = index, "batch failed, halting subsequent batches");
                halted = true;
            }
        }

        let verdict = tracker.should_block();
        let stats = tracker.stats();
        let success = failed_tasks.is_empty() && !verdict.blocked;
        if verdict.blocked {
            tracing::warn!(
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "execution blocked by accumulated issues"
            );
        }

        self.sink.emit(
            &context.project_id,
            "parallel:completed",
            json!({
                "success": success,
                "failed_tasks": failed_tasks.len(),
                "blocked": verdict.blocked,
            }),
        );

        ParallelExecutionResult {
            success,
            batches: batch_results,
            total_files_modified,
            failed_tasks,
            accumulated_stats: stats,
            blocked_by_accumulated_issues: verdict.blocked,
            block_reason: verdict.reason,
            duration: started.elapsed(),
        }
    }

    /// Record skipped store tasks for a batch that never ran.
    async fn skip_batch(
        &self,
        context: &ExecutionContext,
        batch: &[DevelopmentTask],
        dev_to_store: &mut HashMap<String, String>,
    ) {
        for dev_task in batch {
            let depends_on = resolve_dependencies(dev_task, dev_to_store);
            if let Some(task) = create_store_task(&self.store, context, dev_task, depends_on).await
            {
                dev_to_store.insert(dev_task.id.clone(), task.id.clone());
                self.store.skip_task(&task.id).await;
            }
        }
    }
}

/// Map a development task's dependencies to store-task ids. Dependencies
/// land in earlier batches, so they are already in the map; ids left
/// unresolved by a fallback batch are dropped.
fn resolve_dependencies(
    dev_task: &DevelopmentTask,
    dev_to_store: &HashMap<String, String>,
) -> Vec<String> {
    dev_task
        .dependencies
        .iter()
        .filter_map(|dep| dev_to_store.get(dep).cloned())
        .collect()
}

async fn create_store_task(
    store: &JobStore,
    context: &ExecutionContext,
    dev_task: &DevelopmentTask,
    depends_on: Vec<String>,
) -> Option<crate::store::records::Task> {
    store
        .create_task(
            &context.job_id,
            &context.project_id,
            "implementation",
            &dev_task.task_type,
            TaskType::AgentExecution,
            CreateTaskOptions {
                priority: dev_task.priority,
                depends_on,
                input: Some(json!(dev_task)),
            },
        )
        .await
}

/// Execute one development task end to end: agent call under a deadline,
/// then incremental validation of whatever it modified.
#[allow(clippy::too_many_arguments)]
async fn run_one_task(
    store: Arc<JobStore>,
    executor: Arc<dyn AgentExecutor>,
    validator: Arc<IncrementalValidator>,
    sink: Arc<dyn ProgressSink>,
    config: ParallelExecutorConfig,
    context: ExecutionContext,
    dev_task: DevelopmentTask,
    depends_on: Vec<String>,
) -> TaskRunOutcome {
    let Some(task) = create_store_task(&store, &context, &dev_task, depends_on).await else {
        return TaskRunOutcome {
            task_id: String::new(),
            dev_task_id: dev_task.id,
            success: false,
            timed_out: false,
            error: Some(format!("job '{}' not found", context.job_id)),
            files_modified: Vec::new(),
            validation: None,
        };
    };
    store.start_task(&task.id).await;
    sink.emit(
        &context.project_id,
        "task:started",
        json!({ "task_id": task.id, "dev_task_id": dev_task.id }),
    );

    let agent = AgentDefinition::new(dev_task.task_type.clone(), dev_task.task_type.clone());
    let agent_context = AgentContext {
        project_id: context.project_id.clone(),
        project_path: context.project_path.clone(),
        phase: "implementation".to_string(),
        extra: json!(dev_task),
    };
    let prompt = build_task_prompt(&dev_task);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let call = executor.execute(&agent, &prompt, &agent_context, cancel_rx);
    let outcome = match tokio::time::timeout(config.timeouts.task_timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            // Tell the in-flight call to stop at its next checkpoint.
            let _ = cancel_tx.send(true);
            Err(OrchestratorError::TaskTimeout {
                task_id: task.id.clone(),
                timeout: config.timeouts.task_timeout,
            })
        }
    };

    match outcome {
        Ok(agent_outcome) => {
            let validation = if agent_outcome.files_modified.is_empty() {
                None
            } else {
                Some(
                    validator
                        .validate_after_task(&ValidationRequest {
                            task_id: task.id.clone(),
                            files_modified: agent_outcome.files_modified.clone(),
                            project_path: context.project_path.clone(),
                        })
                        .await,
                )
            };

            let validation_failed = validation
                .as_ref()
                .map_or(false, |v| !v.passed && config.fail_on_validation_error);

            if validation_failed {
                let errors = validation
                    .as_ref()
                    .map(|v| v.errors.clone())
                    .unwrap_or_default();
                let message = format!("validation failed with {} errors", errors.len());
                store
                    .complete_task(
                        &task.id,
                        TaskCompletion::failed(message.clone(), Some(errors)),
                    )
                    .await;
                sink.emit(
                    &context.project_id,
                    "task:failed",
                    json!({ "task_id": task.id, "error": message }),
                );
                TaskRunOutcome {
                    task_id: task.id,
                    dev_task_id: dev_task.id,
                    success: false,
                    timed_out: false,
                    error: Some(message),
                    files_modified: agent_outcome.files_modified,
                    validation,
                }
            } else {
                store
                    .complete_task(
                        &task.id,
                        TaskCompletion::succeeded(
                            Some(json!({ "result": agent_outcome.result_text })),
                            agent_outcome.files_modified.clone(),
                        ),
                    )
                    .await;
                sink.emit(
                    &context.project_id,
                    "task:completed",
                    json!({ "task_id": task.id }),
                );
                TaskRunOutcome {
                    task_id: task.id,
                    dev_task_id: dev_task.id,
                    success: true,
                    timed_out: false,
                    error: None,
                    files_modified: agent_outcome.files_modified,
                    validation,
                }
            }
        }
        Err(err) => {
            let timed_out = matches!(err, OrchestratorError::TaskTimeout { .. });
            let message = err.to_string();
            store
                .complete_task(&task.id, TaskCompletion::failed(message.clone(), None))
                .await;
            sink.emit(
                &context.project_id,
                "task:failed",
                json!({ "task_id": task.id, "error": message, "timed_out": timed_out }),
            );
            TaskRunOutcome {
                task_id: task.id,
                dev_task_id: dev_task.id,
                success: false,
                timed_out,
                error: Some(message),
                files_modified: Vec::new(),
                validation: None,
            }
        }
    }
}

fn build_task_prompt(dev_task: &DevelopmentTask) -> String {
    let mut prompt = format!("Implement: {}\n", dev_task.title);
    if !dev_task.files.is_empty() {
        prompt.push_str(&format!("Files: {}\n", dev_task.files.join(", ")));
    }
    for criterion in &dev_task.acceptance_criteria {
        prompt.push_str(&format!("- {}\n", criterion));
    }
    prompt
}

//! Phase-ordered pipeline execution.
//!
//! The pipeline walks the phase catalog in order, driving each phase's
//! agents with bounded retries and per-attempt deadlines. Successful
//! agents feed the artifact registry and leave a checkpoint behind; a
//! failed required phase writes a recovery document and stops, and a
//! later run can resume from that phase with the persisted artifacts.
//! The implementation phase is special-cased: when a task breakdown is
//! available it is delegated to the parallel executor.

pub mod checkpoint;
pub mod outputs;
pub mod phases;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::agents::{
    group_errors_by_file, AgentContext, AgentDefinition, AgentExecutor, AgentOutcome, FastCheck,
    Fixer, ProgressSink,
};
use crate::classify::parse_error_details;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::parallel::{ExecutionContext, ParallelExecutionResult, ParallelExecutorConfig, ParallelTaskExecutor};
use crate::store::records::{CreateTaskOptions, TaskBreakdown, TaskType, ValidationError};
use crate::store::{JobPatch, JobStore, TaskCompletion};
use crate::timeout::TimeoutConfig;
use crate::validation::{IncrementalValidator, ValidationConfig};

pub use checkpoint::{Checkpoint, CheckpointManager, RecoveryRecord};
pub use outputs::{PhaseOutput, PhaseOutputs};
pub use phases::{default_phases, PhaseSpec};

/// Pipeline-level settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Attempts per agent before its phase is considered failed.
    /// Default: 3
    pub max_agent_attempts: u32,
    /// Run one fixer round and re-validate when a failed phase left
    /// auto-fixable errors behind.
    /// Default: true
    pub enable_feedback_loop: bool,
    /// Append the web-preview phase after the core phases.
    pub include_web_preview: bool,
    /// Append the android-build phase after the core phases.
    pub include_android_build: bool,
    pub timeouts: TimeoutConfig,
    pub validation: ValidationConfig,
    pub parallel: ParallelExecutorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_agent_attempts: 3,
            enable_feedback_loop: true,
            include_web_preview: false,
            include_android_build: false,
            timeouts: TimeoutConfig::default(),
            validation: ValidationConfig::default(),
            parallel: ParallelExecutorConfig::default(),
        }
    }
}

/// External capabilities the pipeline is wired with.
pub struct PipelineDeps {
    pub store: Arc<JobStore>,
    pub agent_executor: Arc<dyn AgentExecutor>,
    pub fixer: Arc<dyn Fixer>,
    pub fast_check: Arc<dyn FastCheck>,
    pub sink: Arc<dyn ProgressSink>,
}

/// Options for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip phases before this one; they are treated as already
    /// completed.
    pub start_from_phase: Option<String>,
    /// Artifact registry carried over from an earlier run.
    pub previous_outputs: Option<PhaseOutputs>,
    /// Reuse an existing paused job instead of creating a new one.
    pub resume_job_id: Option<String>,
}

/// Final outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    /// Set when the run finished but something warrants a human look:
    /// an optional phase failed, fixes were auto-applied, or the
    /// parallel executor was blocked by accumulated issues.
    pub requires_review: bool,
    pub job_id: String,
    pub completed_phases: Vec<String>,
    pub outputs: PhaseOutputs,
    pub failed_phase: Option<String>,
    pub error: Option<String>,
    /// How to resume, present when a required phase failed.
    pub resume_instruction: Option<String>,
}

/// Outcome of one phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase: String,
    pub success: bool,
    pub requires_review: bool,
    /// The parallel executor refused to continue; the feedback loop must
    /// not override its veto.
    pub blocked: bool,
    pub errors: Vec<ValidationError>,
    pub error: Option<String>,
    /// Files touched by the phase's agents or tasks.
    pub files_modified: Vec<String>,
}

/// Drives the full generation pipeline for a project.
pub struct PipelineExecutor {
    deps: PipelineDeps,
    validator: Arc<IncrementalValidator>,
    config: PipelineConfig,
}

impl PipelineExecutor {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let validator = Arc::new(IncrementalValidator::new(
            Arc::clone(&deps.fast_check),
            Arc::clone(&deps.fixer),
            config.validation.clone(),
        ));
        Self {
            deps,
            validator,
            config,
        }
    }

    /// Run the pipeline end to end.
    pub async fn run(
        &self,
        project_id: &str,
        project_path: &Path,
        options: RunOptions,
    ) -> PipelineResult {
        let job = match &options.resume_job_id {
            Some(id) => match self.deps.store.resume_job(id).await {
                Some((job, _ready)) => job,
                None => {
                    tracing::warn!(job_id = %id, "resume job not found, creating a new one");
                    self.deps.store.create_job(project_id, Value::Null).await
                }
            },
            None => self.deps.store.create_job(project_id, Value::Null).await,
        };
        self.deps.store.start_job(&job.id).await;
        self.deps.sink.emit(
            project_id,
            "pipeline:started",
            json!({ "job_id": job.id, "start_from": options.start_from_phase }),
        );

        match self
            .run_inner(&job.id, project_id, project_path, &options)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let message = err.to_string();
                tracing::error!(job_id = %job.id, error = %message, "pipeline run aborted");
                self.deps
                    .store
                    .complete_job(&job.id, false, Some(message.clone()))
                    .await;
                self.deps.sink.emit(
                    project_id,
                    "pipeline:failed",
                    json!({ "job_id": job.id, "error": message }),
                );
                PipelineResult {
                    success: false,
                    requires_review: true,
                    job_id: job.id,
                    completed_phases: Vec::new(),
                    outputs: options.previous_outputs.unwrap_or_default(),
                    failed_phase: None,
                    error: Some(message),
                    resume_instruction: None,
                }
            }
        }
    }

    /// Resume a previously failed run. When no explicit starting point or
    /// outputs are given, the recovery document written at failure time
    /// supplies both.
    pub async fn resume(
        &self,
        project_id: &str,
        project_path: &Path,
        start_from_phase: Option<String>,
        previous_outputs: Option<PhaseOutputs>,
    ) -> OrchestratorResult<PipelineResult> {
        let manager = CheckpointManager::new(project_path)?;
        let recovery = manager.load_recovery()?;

        let start_from_phase = start_from_phase
            .or_else(|| recovery.as_ref().map(|r| r.failed_phase.clone()));
        let previous_outputs =
            previous_outputs.or_else(|| recovery.map(|r| r.outputs));

        Ok(self
            .run(
                project_id,
                project_path,
                RunOptions {
                    start_from_phase,
                    previous_outputs,
                    resume_job_id: None,
                },
            )
            .await)
    }

    /// Run only the parallel implementation step for an externally
    /// produced breakdown, under its own job.
    pub async fn run_parallel_implementation(
        &self,
        project_id: &str,
        project_path: &Path,
        breakdown: &TaskBreakdown,
    ) -> ParallelExecutionResult {
        let job = self.deps.store.create_job(project_id, Value::Null).await;
        self.deps.store.start_job(&job.id).await;

        let context = ExecutionContext {
            job_id: job.id.clone(),
            project_id: project_id.to_string(),
            project_path: project_path.to_path_buf(),
        };
        let result = self.parallel_executor().execute(&context, breakdown).await;

        let error = if result.success {
            None
        } else {
            Some(implementation_error_message(&result))
        };
        self.deps
            .store
            .complete_job(&job.id, result.success, error)
            .await;
        result
    }

    async fn run_inner(
        &self,
        job_id: &str,
        project_id: &str,
        project_path: &Path,
        options: &RunOptions,
    ) -> OrchestratorResult<PipelineResult> {
        let checkpoints = CheckpointManager::new(project_path)?;
        let all_phases = default_phases(
            self.config.include_web_preview,
            self.config.include_android_build,
        );

        let start_index = match &options.start_from_phase {
            Some(name) => all_phases
                .iter()
                .position(|p| &p.name == name)
                .ok_or_else(|| OrchestratorError::PhaseFailed {
                    phase: name.clone(),
                    message: "unknown phase".to_string(),
                })?,
            None => 0,
        };

        let mut completed_phases: Vec<String> = all_phases[..start_index]
            .iter()
            .map(|p| p.name.clone())
            .collect();
        let mut outputs = options.previous_outputs.clone().unwrap_or_default();
        let mut requires_review = false;

        for phase in &all_phases[start_index..] {
            self.deps
                .store
                .update_job(
                    job_id,
                    JobPatch {
                        current_phase: Some(phase.name.clone()),
                        ..JobPatch::default()
                    },
                )
                .await;
            self.deps.sink.emit(
                project_id,
                "phase:started",
                json!({ "job_id": job_id, "phase": phase.name }),
            );

            let mut result = self
                .run_phase(
                    job_id,
                    phase,
                    &mut outputs,
                    project_id,
                    project_path,
                    &checkpoints,
                    &completed_phases,
                )
                .await;

            if !result.success
                && !result.blocked
                && self.config.enable_feedback_loop
            {
                if let Some(recovered) = self
                    .attempt_feedback(job_id, phase, &mut outputs, project_id, project_path)
                    .await
                {
                    result = recovered;
                }
            }

            if result.success {
                completed_phases.push(phase.name.clone());
                requires_review |= result.requires_review;
                self.deps.sink.emit(
                    project_id,
                    "phase:completed",
                    json!({ "job_id": job_id, "phase": phase.name }),
                );
                continue;
            }

            if phase.required && !phase.continue_on_error {
                let instruction = format!(
                    "resume from phase '{}' with the checkpointed outputs",
                    phase.name
                );
                let record = RecoveryRecord {
                    failed_phase: phase.name.clone(),
                    errors: result.errors.clone(),
                    outputs: outputs.clone(),
                    completed_phases: completed_phases.clone(),
                    resume_instruction: instruction.clone(),
                    recorded_at: Utc::now(),
                };
                if let Err(err) = checkpoints.save_recovery(&record) {
                    tracing::warn!(error = %err, "failed to persist recovery record");
                }

                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("phase '{}' failed", phase.name));
                self.deps
                    .store
                    .complete_job(job_id, false, Some(message.clone()))
                    .await;
                self.deps.sink.emit(
                    project_id,
                    "pipeline:failed",
                    json!({ "job_id": job_id, "phase": phase.name, "error": message }),
                );
                return Ok(PipelineResult {
                    success: false,
                    requires_review: true,
                    job_id: job_id.to_string(),
                    completed_phases,
                    outputs,
                    failed_phase: Some(phase.name.clone()),
                    error: Some(message),
                    resume_instruction: Some(instruction),
                });
            }

            tracing::warn!(
                phase = %phase.name,
                error = result.error.as_deref().unwrap_or("unknown"),
                "optional phase failed, continuing"
            );
            requires_review = true;
        }

        if let Err(err) = checkpoints.clear_recovery() {
            tracing::warn!(error = %err, "failed to clear recovery record");
        }
        self.deps.store.complete_job(job_id, true, None).await;
        self.deps.sink.emit(
            project_id,
            "pipeline:completed",
            json!({ "job_id": job_id, "requires_review": requires_review }),
        );

        Ok(PipelineResult {
            success: true,
            requires_review,
            job_id: job_id.to_string(),
            completed_phases,
            outputs,
            failed_phase: None,
            error: None,
            resume_instruction: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        job_id: &str,
        phase: &PhaseSpec,
        outputs: &mut PhaseOutputs,
        project_id: &str,
        project_path: &Path,
        checkpoints: &CheckpointManager,
        completed_phases: &[String],
    ) -> PhaseResult {
        if phase.name == "implementation" {
            if let Some(breakdown) = outputs.task_breakdown().cloned() {
                let result = self
                    .run_implementation(job_id, &breakdown, project_id, project_path)
                    .await;
                if result.success && phase.checkpoint {
                    // Unlike per-agent saves, the whole phase is done here,
                    // so it belongs in the completed list.
                    let mut completed = completed_phases.to_vec();
                    completed.push(phase.name.clone());
                    let snapshot = Checkpoint {
                        phase: phase.name.clone(),
                        agent_id: "parallel-executor".to_string(),
                        output: json!({ "tasks": breakdown.tasks.len() }),
                        files_modified: result.files_modified.clone(),
                        outputs: outputs.clone(),
                        completed_phases: completed,
                        saved_at: Utc::now(),
                    };
                    if let Err(err) = checkpoints.save(&snapshot) {
                        tracing::warn!(
                            phase = %phase.name,
                            error = %err,
                            "failed to save checkpoint"
                        );
                    }
                }
                return result;
            }
            tracing::warn!("no task breakdown available, driving implementation agents directly");
        }

        let context_value = outputs.to_value();

        let runs: Vec<(&AgentDefinition, OrchestratorResult<AgentOutcome>)> = if phase.parallel {
            join_all(phase.agents.iter().map(|agent| {
                let context_value = context_value.clone();
                async move {
                    let result = self
                        .execute_agent(
                            job_id,
                            phase,
                            agent,
                            context_value,
                            project_id,
                            project_path,
                            self.config.max_agent_attempts,
                        )
                        .await;
                    (agent, result)
                }
            }))
            .await
        } else {
            let mut runs = Vec::with_capacity(phase.agents.len());
            for agent in &phase.agents {
                let result = self
                    .execute_agent(
                        job_id,
                        phase,
                        agent,
                        context_value.clone(),
                        project_id,
                        project_path,
                        self.config.max_agent_attempts,
                    )
                    .await;
                runs.push((agent, result));
            }
            runs
        };

        let mut errors: Vec<ValidationError> = Vec::new();
        let mut failed_agents: Vec<String> = Vec::new();
        let mut files_modified: Vec<String> = Vec::new();
        for (agent, result) in runs {
            match result {
                Ok(outcome) => {
                    files_modified.extend(outcome.files_modified.iter().cloned());
                    outputs.insert_agent_result(phase.effective_output_key(), &outcome.result_text);
                    if phase.checkpoint {
                        let snapshot = Checkpoint {
                            phase: phase.name.clone(),
                            agent_id: agent.id.clone(),
                            output: json!({ "result": outcome.result_text }),
                            files_modified: outcome.files_modified.clone(),
                            outputs: outputs.clone(),
                            completed_phases: completed_phases.to_vec(),
                            saved_at: Utc::now(),
                        };
                        if let Err(err) = checkpoints.save(&snapshot) {
                            tracing::warn!(
                                phase = %phase.name,
                                agent = %agent.id,
                                error = %err,
                                "failed to save checkpoint"
                            );
                        }
                    }
                }
                Err(err) => {
                    failed_agents.push(agent.id.clone());
                    errors.extend(parse_error_details(&err.to_string()));
                }
            }
        }

        if failed_agents.is_empty() {
            PhaseResult {
                phase: phase.name.clone(),
                success: true,
                requires_review: false,
                blocked: false,
                errors: Vec::new(),
                error: None,
                files_modified,
            }
        } else {
            PhaseResult {
                phase: phase.name.clone(),
                success: false,
                requires_review: false,
                blocked: false,
                errors,
                error: Some(format!(
                    "phase '{}' failed: agents [{}] did not complete",
                    phase.name,
                    failed_agents.join(", ")
                )),
                files_modified,
            }
        }
    }

    async fn run_implementation(
        &self,
        job_id: &str,
        breakdown: &TaskBreakdown,
        project_id: &str,
        project_path: &Path,
    ) -> PhaseResult {
        let context = ExecutionContext {
            job_id: job_id.to_string(),
            project_id: project_id.to_string(),
            project_path: project_path.to_path_buf(),
        };
        let result = self.parallel_executor().execute(&context, breakdown).await;

        let errors: Vec<ValidationError> = result
            .failed_tasks
            .iter()
            .flat_map(|f| parse_error_details(&f.error))
            .collect();
        let error = if result.success {
            None
        } else {
            Some(implementation_error_message(&result))
        };

        PhaseResult {
            phase: "implementation".to_string(),
            success: result.success,
            requires_review: result.blocked_by_accumulated_issues,
            blocked: result.blocked_by_accumulated_issues,
            errors,
            error,
            files_modified: result.total_files_modified,
        }
    }

    /// One bounded feedback round for a failed phase: fix whatever is
    /// auto-fixable, then re-run the phase's validating agent once. Returns
    /// the recovered phase result, or `None` when recovery was not
    /// attempted or did not succeed.
    async fn attempt_feedback(
        &self,
        job_id: &str,
        phase: &PhaseSpec,
        outputs: &mut PhaseOutputs,
        project_id: &str,
        project_path: &Path,
    ) -> Option<PhaseResult> {
        let analysis = self.deps.store.analyze_errors(job_id).await;
        if !analysis.can_auto_fix {
            return None;
        }
        let agent = phase.validating_agent()?;

        let fixable: Vec<ValidationError> = analysis
            .errors
            .iter()
            .filter(|e| e.auto_fixable)
            .map(|e| e.error.clone())
            .collect();
        tracing::info!(
            phase = %phase.name,
            fixable = fixable.len(),
            "attempting feedback round"
        );

        let fix_task = match analysis.errors.first() {
            Some(first) => self.deps.store.create_fix_task(&first.task_id).await,
            None => None,
        };
        if let Some(task) = &fix_task {
            self.deps.store.start_task(&task.id).await;
        }

        let grouped = group_errors_by_file(&fixable);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let fix_outcome = self
            .deps
            .fixer
            .fix(project_path, &grouped, cancel_rx)
            .await;

        match fix_outcome {
            Ok(outcome) => {
                if let Some(task) = &fix_task {
                    self.deps
                        .store
                        .complete_task(
                            &task.id,
                            TaskCompletion::succeeded(
                                Some(json!({ "result": outcome.result_text })),
                                outcome.files_modified,
                            ),
                        )
                        .await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "feedback fixer failed");
                if let Some(task) = &fix_task {
                    self.deps
                        .store
                        .complete_task(&task.id, TaskCompletion::failed(err.to_string(), None))
                        .await;
                }
                return None;
            }
        }

        let context_value = outputs.to_value();
        match self
            .execute_agent(
                job_id,
                phase,
                agent,
                context_value,
                project_id,
                project_path,
                1,
            )
            .await
        {
            Ok(outcome) => {
                outputs.insert_agent_result(phase.effective_output_key(), &outcome.result_text);
                self.deps.sink.emit(
                    project_id,
                    "phase:recovered",
                    json!({ "job_id": job_id, "phase": phase.name }),
                );
                Some(PhaseResult {
                    phase: phase.name.clone(),
                    success: true,
                    // Fixes were applied without an agent authoring them.
                    requires_review: true,
                    blocked: false,
                    errors: Vec::new(),
                    error: None,
                    files_modified: outcome.files_modified.clone(),
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, "revalidation after feedback failed");
                None
            }
        }
    }

    /// Execute one agent under a per-attempt deadline with bounded retries
    /// and category-specific backoff between attempts.
    #[allow(clippy::too_many_arguments)]
    async fn execute_agent(
        &self,
        job_id: &str,
        phase: &PhaseSpec,
        agent: &AgentDefinition,
        context_value: Value,
        project_id: &str,
        project_path: &Path,
        max_attempts: u32,
    ) -> OrchestratorResult<AgentOutcome> {
        let task = self
            .deps
            .store
            .create_task(
                job_id,
                project_id,
                &phase.name,
                &agent.id,
                TaskType::AgentExecution,
                CreateTaskOptions::default(),
            )
            .await
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        self.deps.store.start_task(&task.id).await;
        self.deps
            .store
            .update_job(
                job_id,
                JobPatch {
                    current_agent: Some(agent.id.clone()),
                    ..JobPatch::default()
                },
            )
            .await;

        let agent_context = AgentContext {
            project_id: project_id.to_string(),
            project_path: project_path.to_path_buf(),
            phase: phase.name.clone(),
            extra: context_value,
        };
        let prompt = build_phase_prompt(phase, agent);

        let max_attempts = max_attempts.max(1);
        let mut last_error: Option<OrchestratorError> = None;
        for attempt in 1..=max_attempts {
            let deadline = self.config.timeouts.agent_timeout_for_attempt(attempt);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let call = self
                .deps
                .agent_executor
                .execute(agent, &prompt, &agent_context, cancel_rx);

            let result = match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = cancel_tx.send(true);
                    Err(OrchestratorError::TaskTimeout {
                        task_id: task.id.clone(),
                        timeout: deadline,
                    })
                }
            };

            match result {
                Ok(outcome) => {
                    self.deps
                        .store
                        .complete_task(
                            &task.id,
                            TaskCompletion::succeeded(
                                Some(json!({ "result": outcome.result_text })),
                                outcome.files_modified.clone(),
                            ),
                        )
                        .await;
                    self.deps.sink.emit(
                        project_id,
                        "agent:completed",
                        json!({ "job_id": job_id, "phase": phase.name, "agent": agent.id }),
                    );
                    return Ok(outcome);
                }
                Err(err) => {
                    let category = err.classify();
                    tracing::warn!(
                        agent = %agent.id,
                        attempt,
                        category = category.as_label(),
                        error = %err,
                        "agent attempt failed"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.timeouts.retry_backoff(category)).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| OrchestratorError::AgentFailed {
            agent_id: agent.id.clone(),
            message: "no attempts executed".to_string(),
        });
        let message = err.to_string();
        self.deps
            .store
            .complete_task(
                &task.id,
                TaskCompletion::failed(message.clone(), Some(parse_error_details(&message))),
            )
            .await;
        self.deps.sink.emit(
            project_id,
            "agent:failed",
            json!({ "job_id": job_id, "phase": phase.name, "agent": agent.id, "error": message }),
        );
        Err(err)
    }

    fn parallel_executor(&self) -> ParallelTaskExecutor {
        ParallelTaskExecutor::new(
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.agent_executor),
            Arc::clone(&self.validator),
            Arc::clone(&self.deps.sink),
            self.config.parallel.clone(),
        )
    }
}

fn implementation_error_message(result: &ParallelExecutionResult) -> String {
    if let Some(reason) = &result.block_reason {
        reason.clone()
    } else {
        format!("{} implementation tasks failed", result.failed_tasks.len())
    }
}

fn build_phase_prompt(phase: &PhaseSpec, agent: &AgentDefinition) -> String {
    format!(
        "Act as {} for the '{}' phase. Prior phase artifacts are provided in the context.",
        agent.role, phase.name
    )
}

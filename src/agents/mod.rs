//! External capability seams.
//!
//! The orchestrator never invokes a language model, compiler, or transport
//! itself. Everything slow, remote, or vendor-specific enters through the
//! traits here, injected into the executors by the caller. Cancellation is
//! cooperative: implementations receive a `watch::Receiver<bool>` and are
//! expected to observe it at their next internal checkpoint rather than
//! being preempted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::OrchestratorResult;
use crate::store::records::ValidationError;

/// An agent role participating in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefinition {
    /// Stable identifier, also used as the task's `agent_id`.
    pub id: String,
    /// Role name handed to the executor (e.g. "architect", "backend").
    pub role: String,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Context handed to an agent invocation alongside its prompt.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub project_id: String,
    pub project_path: PathBuf,
    /// Phase the invocation belongs to.
    pub phase: String,
    /// Opaque extras threaded from accumulated phase outputs.
    pub extra: Value,
}

/// What an agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// The agent's textual result (structured output is parsed by the
    /// consuming phase).
    pub result_text: String,
    /// Files the agent created or rewrote.
    pub files_modified: Vec<String>,
}

/// External capability that performs the actual work of one agent: an
/// opaque, possibly slow, possibly failing remote call.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute one agent with a prompt. Implementations should observe
    /// `cancel` and return early when it flips to `true`.
    async fn execute(
        &self,
        agent: &AgentDefinition,
        prompt: &str,
        context: &AgentContext,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<AgentOutcome>;
}

/// External capability that repairs a structured error set, grouped by
/// file. Same operational shape as [`AgentExecutor`]; may rewrite files.
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(
        &self,
        project_path: &Path,
        errors_by_file: &BTreeMap<String, Vec<ValidationError>>,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<AgentOutcome>;
}

/// External fast validation check (typecheck, lint) returning raw
/// diagnostic text for the classifier to parse.
#[async_trait]
pub trait FastCheck: Send + Sync {
    async fn run(
        &self,
        project_path: &Path,
        files_modified: Option<&[String]>,
    ) -> OrchestratorResult<String>;
}

/// Fire-and-forget progress event sink. Never awaited for correctness,
/// only for observability; implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, project_id: &str, event: &str, payload: Value);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _project_id: &str, _event: &str, _payload: Value) {}
}

/// Sink that forwards events to the tracing subscriber at debug level.
#[derive(Debug, Default, Clone)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, project_id: &str, event: &str, payload: Value) {
        tracing::debug!(project_id, event, %payload, "progress");
    }
}

/// Group a flat error list by file, ready for a fixer prompt.
pub fn group_errors_by_file(
    errors: &[ValidationError],
) -> BTreeMap<String, Vec<ValidationError>> {
    let mut grouped: BTreeMap<String, Vec<ValidationError>> = BTreeMap::new();
    for error in errors {
        grouped.entry(error.file.clone()).or_default().push(error.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::Severity;

    fn err(file: &str, line: u32) -> ValidationError {
        ValidationError {
            file: file.to_string(),
            line: Some(line),
            column: None,
            code: "TS2304".to_string(),
            message: "Cannot find name".to_string(),
            severity: Severity::Error,
        }
    }

    #[test]
    fn test_group_errors_by_file() {
        let errors = vec![err("a.ts", 1), err("b.ts", 2), err("a.ts", 9)];
        let grouped = group_errors_by_file(&errors);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["a.ts"].len(), 2);
        assert_eq!(grouped["b.ts"].len(), 1);
    }

    #[test]
    fn test_null_sink_is_silent() {
        NullProgressSink.emit("proj", "job:started", serde_json::json!({}));
    }
}

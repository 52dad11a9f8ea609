//! Orchestration engine for multi-phase, multi-agent code generation.
//!
//! The pipeline walks a fixed phase sequence (analysis through QA),
//! driving external agents with bounded retries and checkpoints. The
//! implementation phase fans out over a dependency-aware parallel
//! executor with incremental validation feedback after every task, and
//! an accumulated-error tracker that can veto further execution when
//! quality trends the wrong way. Everything slow or vendor-specific
//! (models, compilers, transports) enters through the traits in
//! [`agents`].

pub mod agents;
pub mod classify;
pub mod error;
pub mod parallel;
pub mod pipeline;
pub mod store;
pub mod timeout;
pub mod validation;

pub use agents::{
    AgentContext, AgentDefinition, AgentExecutor, AgentOutcome, FastCheck, Fixer,
    NullProgressSink, ProgressSink, TracingProgressSink,
};
pub use classify::AutoFixMatcher;
pub use error::{ErrorCategory, OrchestratorError, OrchestratorResult};
pub use parallel::{
    ExecutionContext, ParallelExecutionResult, ParallelExecutorConfig, ParallelTaskExecutor,
};
pub use pipeline::{
    CheckpointManager, PhaseOutput, PhaseOutputs, PipelineConfig, PipelineDeps, PipelineExecutor,
    PipelineResult, RunOptions,
};
pub use store::{FileStateMirror, JobStore, NullStateMirror, TaskBreakdown};
pub use timeout::TimeoutConfig;
pub use validation::{
    AccumulatedErrorTracker, IncrementalValidator, TrackerConfig, ValidationConfig,
};

//! Error types for flow orchestration.

use thiserror::Error;

use crate::runner::FlowRun;

/// Structural errors detected before any step runs.
///
/// These are raised by [`crate::flow::FlowDefinition::validate`] and by the
/// dependency resolver, independently of any schema validation an external
/// loader may have performed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowValidationError {
    /// The flow declares no steps at all.
    #[error("flow has no steps")]
    EmptyFlow,

    /// Two steps share the same id.
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    /// A `dependsOn` entry names a step that does not exist.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    /// The dependency graph contains a cycle. `path` lists the nodes in
    /// cycle order, ending where it started.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// `output.from` names a step that does not exist.
    #[error("output references unknown step '{0}'")]
    UnknownOutputStep(String),
}

/// Errors that can occur while executing a flow.
///
/// Per-step failures are *not* represented here: they are captured as data
/// inside [`crate::runner::StepResult::error`] and never thrown past the
/// step boundary. `FlowError::Execution` is raised only when `failFast`
/// truncates a run.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] FlowValidationError),

    /// The run was aborted by the fail-fast policy. Carries the partial run
    /// with every step result gathered up to the aborting wave.
    #[error("flow run {flow_run_id} aborted: step '{step_id}' failed: {message}")]
    Execution {
        flow_run_id: String,
        step_id: String,
        message: String,
        partial: Box<FlowRun>,
    },

    /// A step tried to read an upstream result that was never produced.
    /// This is the intended cascading-failure path when `failFast` is off.
    #[error("step '{for_step}' is missing upstream result '{step_id}'")]
    MissingUpstreamResult { for_step: String, step_id: String },

    /// Input resolution or a named transform failed for a step.
    #[error("transform error in step '{step_id}': {message}")]
    Transform { step_id: String, message: String },

    /// Gate configuration or judge invocation failed.
    #[error("gate error in step '{step_id}': {message}")]
    Gate { step_id: String, message: String },

    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    pub(crate) fn transform(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn gate(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Gate {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

//! Declarative multi-agent flow orchestration.
//!
//! A flow is a JSON-defined DAG of steps. Each step invokes an agent by
//! reference (or evaluates a gate, picks a branch, or fans out for
//! consensus); `dependsOn` edges group the steps into waves that execute
//! strictly in order, with every step inside a wave running concurrently.
//! Step results are immutable once written, failures are data rather than
//! exceptions, and the `failFast` setting decides whether a failing wave
//! truncates the run.
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_flow::{FlowDefinition, FlowRequest, FlowRunner, MockExecutor};
//!
//! # async fn demo() -> Result<(), agent_flow::FlowError> {
//! let flow = FlowDefinition::from_json(r#"{
//!     "id": "article",
//!     "name": "Article pipeline",
//!     "steps": [
//!         { "id": "outline", "agent": "planner" },
//!         { "id": "draft", "agent": "writer", "dependsOn": ["outline"],
//!           "input": { "source": "step", "stepId": "outline" } }
//!     ],
//!     "output": { "from": "draft" }
//! }"#)?;
//!
//! let runner = FlowRunner::new(Arc::new(MockExecutor::new()));
//! let run = runner.execute(&flow, &FlowRequest::new("write about crabs")).await?;
//! println!("{}", run.output);
//! # Ok(())
//! # }
//! ```

pub mod condition;
pub mod error;
pub mod events;
pub mod executor;
pub mod flow;
pub mod gate;
pub mod resolver;
pub mod runner;
pub mod transform;

pub use condition::{ConditionContext, ConditionEvaluator, ConditionOutcome};
pub use error::{FlowError, FlowValidationError};
pub use events::{EventLogger, NullEventLogger, TracingEventLogger};
pub use executor::{
    AgentExecutor, AgentRequest, AgentResponse, CommandExecutor, ExecutorError, ExecutorProvider,
    HttpExecutor, MockExecutor,
};
pub use flow::{
    BranchArm, ConsensusConfig, FlowDefinition, FlowSettings, GateConfig, InputConfig, InputSource,
    LoopConfig, OnFailPolicy, OutputConfig, OutputFormat, OutputSource, StepDefinition, StepKind,
};
pub use gate::{
    CriterionResult, EvaluationCriterion, EvaluationResult, ExecutorJudge, GateAction,
    GateDecision, GateEvaluator,
    JudgeInvoker, ScriptedJudge,
};
pub use resolver::DependencyResolver;
pub use runner::{FlowRequest, FlowRun, FlowRunner, StepResult};
pub use transform::{CustomTransform, TransformPipeline};

//! Flow data model: validated step and flow definitions.
//!
//! A flow is a declarative DAG of steps, each invoking an agent (or a gate,
//! branch, or consensus variant), with declared dependencies, input sourcing
//! and output aggregation. Definitions arrive pre-validated from an external
//! loader; [`FlowDefinition::validate`] independently re-checks referential
//! integrity so malformed input that slipped past schema validation still
//! fails before anything runs.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::error::FlowValidationError;

/// A complete flow definition: an ordered list of steps plus output and
/// execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepDefinition>,
    pub output: OutputConfig,
    #[serde(default)]
    pub settings: FlowSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl FlowDefinition {
    /// Parses a flow definition from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Checks structural invariants: at least one step, unique step ids,
    /// and every `dependsOn` / `output.from` reference resolving to an
    /// existing step.
    pub fn validate(&self) -> Result<(), FlowValidationError> {
        if self.steps.is_empty() {
            return Err(FlowValidationError::EmptyFlow);
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(FlowValidationError::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(FlowValidationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for from in self.output.from.ids() {
            if !ids.contains(from) {
                return Err(FlowValidationError::UnknownOutputStep(from.to_string()));
            }
        }

        Ok(())
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Where the aggregated flow output is read from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputSource {
    Single(String),
    Many(Vec<String>),
}

impl OutputSource {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            OutputSource::Single(id) => vec![id.as_str()],
            OutputSource::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Rendering format for the aggregated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `## {stepId}` sections, blank-line joined.
    #[default]
    Markdown,
    /// Newline-joined non-empty contents.
    Concat,
    /// JSON object keyed by step id.
    Json,
}

/// Output aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub from: OutputSource,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Flow-level execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowSettings {
    /// Caps simultaneous agent invocations within a wave. `None` means the
    /// whole wave fans out at once.
    pub max_parallelism: Option<usize>,
    /// Abort the run at the end of the first wave containing a non-skip
    /// failure. Defaults to `true`.
    pub fail_fast: bool,
    /// Advisory only; the runner never enforces it.
    pub timeout: Option<u64>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            fail_fast: true,
            timeout: None,
        }
    }
}

/// Where a step's input text comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    /// The original user prompt.
    #[default]
    Request,
    /// A single named upstream step's result content.
    Step,
    /// An ordered join of named upstream steps' contents.
    Aggregate,
    /// The original prompt plus any quality-gate feedback accumulated for
    /// this step during the current run.
    Feedback,
}

/// Input sourcing and transform configuration for one step.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputConfig {
    pub source: InputSource,
    /// Upstream step id for `source: step`.
    pub step_id: Option<String>,
    /// Upstream step ids for `source: aggregate`.
    pub from: Vec<String>,
    /// Named transform applied to the resolved text. Defaults to
    /// `passthrough`.
    pub transform: Option<String>,
    pub transform_args: Option<JsonValue>,
}

/// Per-step retry configuration. Consumed by the agent-invocation layer
/// beneath the executor; the runner treats one invocation per step per wave
/// pass as final.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Quality-gate failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailPolicy {
    #[default]
    Retry,
    Halt,
    ContinueWithWarning,
}

/// Quality-gate configuration: criteria named from the built-in library,
/// a pass threshold, and a failure policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    /// Judge agent id. `None` uses the runner's default judge.
    #[serde(default)]
    pub judge: Option<String>,
    pub criteria: Vec<String>,
    pub threshold: f64,
    #[serde(default)]
    pub on_fail: OnFailPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// Feedback-loop configuration attached to a gate step. When present,
/// `max_iterations` further caps the gate's retry count.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub max_iterations: Option<u32>,
}

/// One arm of a branch step: a condition expression and the agent to invoke
/// when it holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchArm {
    pub condition: String,
    pub agent: String,
}

/// Consensus configuration: the agents to fan out to and the minimum number
/// of successful responses required.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusConfig {
    pub agents: Vec<String>,
    /// Defaults to all listed agents.
    #[serde(default)]
    pub min_agreement: Option<usize>,
}

/// Type-specific step payload. Each variant carries only its own fields;
/// the loader switches on `type` once and constructs the matching variant.
#[derive(Debug, Clone, Default)]
pub enum StepKind {
    #[default]
    Agent,
    Gate {
        evaluate: GateConfig,
        feedback_loop: Option<LoopConfig>,
    },
    Branch {
        branches: Vec<BranchArm>,
        default: Option<String>,
    },
    Consensus(ConsensusConfig),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Agent => "agent",
            StepKind::Gate { .. } => "gate",
            StepKind::Branch { .. } => "branch",
            StepKind::Consensus(_) => "consensus",
        }
    }
}

/// One step of a flow.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawStepDefinition")]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    /// Agent reference for agent steps (and the fallback judge for gates).
    pub agent: Option<String>,
    pub depends_on: Vec<String>,
    pub input: InputConfig,
    /// Optional gating expression over prior results. Empty or missing
    /// means the step always executes.
    pub condition: Option<String>,
    /// Advisory only.
    pub timeout: Option<u64>,
    /// Advisory to the runner; see [`RetryConfig`].
    pub retry: Option<RetryConfig>,
    pub kind: StepKind,
}

impl StepDefinition {
    /// Creates a plain agent step. Builder-style `with_` methods fill in the
    /// rest; primarily used by tests and embedders constructing flows in
    /// code rather than from JSON.
    pub fn agent(id: impl Into<String>, agent: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent: Some(agent.into()),
            depends_on: Vec::new(),
            input: InputConfig::default(),
            condition: None,
            timeout: None,
            retry: None,
            kind: StepKind::Agent,
        }
    }

    /// Creates a gate step evaluating the named upstream step.
    pub fn gate(id: impl Into<String>, gated_step: impl Into<String>, evaluate: GateConfig) -> Self {
        let id = id.into();
        let gated = gated_step.into();
        Self {
            name: id.clone(),
            id,
            agent: None,
            depends_on: vec![gated.clone()],
            input: InputConfig {
                source: InputSource::Step,
                step_id: Some(gated),
                ..InputConfig::default()
            },
            condition: None,
            timeout: None,
            retry: None,
            kind: StepKind::Gate {
                evaluate,
                feedback_loop: None,
            },
        }
    }

    /// Creates a branch step.
    pub fn branch(id: impl Into<String>, branches: Vec<BranchArm>, default: Option<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent: None,
            depends_on: Vec::new(),
            input: InputConfig::default(),
            condition: None,
            timeout: None,
            retry: None,
            kind: StepKind::Branch { branches, default },
        }
    }

    /// Creates a consensus step.
    pub fn consensus(id: impl Into<String>, consensus: ConsensusConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent: None,
            depends_on: Vec::new(),
            input: InputConfig::default(),
            condition: None,
            timeout: None,
            retry: None,
            kind: StepKind::Consensus(consensus),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<&str>) -> Self {
        self.depends_on = deps.into_iter().map(String::from).collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_input(mut self, input: InputConfig) -> Self {
        self.input = input;
        self
    }
}

/// Wire form of a step: `type` string plus mutually-exclusive payload
/// fields. Converted into the [`StepKind`] union exactly once at load time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStepDefinition {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    step_type: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    input: InputConfig,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    retry: Option<RetryConfig>,
    #[serde(default)]
    evaluate: Option<GateConfig>,
    #[serde(rename = "loop", default)]
    feedback_loop: Option<LoopConfig>,
    #[serde(default)]
    branches: Option<Vec<BranchArm>>,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    consensus: Option<ConsensusConfig>,
}

impl TryFrom<RawStepDefinition> for StepDefinition {
    type Error = String;

    fn try_from(raw: RawStepDefinition) -> Result<Self, Self::Error> {
        let kind = match raw.step_type.as_deref().unwrap_or("agent") {
            "agent" => StepKind::Agent,
            "gate" => StepKind::Gate {
                evaluate: raw
                    .evaluate
                    .ok_or_else(|| format!("gate step '{}' is missing 'evaluate'", raw.id))?,
                feedback_loop: raw.feedback_loop,
            },
            "branch" => StepKind::Branch {
                branches: raw
                    .branches
                    .ok_or_else(|| format!("branch step '{}' is missing 'branches'", raw.id))?,
                default: raw.default,
            },
            "consensus" => StepKind::Consensus(
                raw.consensus
                    .ok_or_else(|| format!("consensus step '{}' is missing 'consensus'", raw.id))?,
            ),
            other => return Err(format!("step '{}' has unknown type '{}'", raw.id, other)),
        };

        Ok(StepDefinition {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            agent: raw.agent,
            depends_on: raw.depends_on,
            input: raw.input,
            condition: raw.condition,
            timeout: raw.timeout,
            retry: raw.retry,
            kind,
        })
    }
}

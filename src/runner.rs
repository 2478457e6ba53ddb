//! The wave-by-wave execution driver.
//!
//! `FlowRunner::execute` resolves a flow's steps into waves once, then
//! drives them strictly in order: every step of a wave is spawned as its
//! own task, the whole wave is awaited (join-all, no mid-wave
//! cancellation), results are folded into the run's results map by the
//! driver, and only then is the fail-fast decision made. Concurrency
//! exists only within a wave.

use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::condition::{ConditionContext, ConditionEvaluator};
use crate::error::{FlowError, FlowValidationError};
use crate::events::{EventLogger, TracingEventLogger, emit};
use crate::executor::{AgentExecutor, AgentRequest, AgentResponse};
use crate::flow::{FlowDefinition, StepDefinition, StepKind, OutputFormat};
use crate::gate::{ExecutorJudge, GateAction, GateEvaluator, JudgeInvoker};
use crate::resolver::DependencyResolver;
use crate::transform::TransformPipeline;

/// The initial request a flow runs against.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    pub user_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl FlowRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Outcome of one step in one run. Written into the run's results map
/// exactly once and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
}

impl StepResult {
    pub fn succeeded(
        step_id: &str,
        response: AgentResponse,
        duration_ms: u64,
        started_at_ms: u64,
        completed_at_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            skipped: false,
            skip_reason: None,
            result: Some(response),
            error: None,
            duration_ms,
            started_at_ms,
            completed_at_ms,
        }
    }

    pub fn failed(
        step_id: &str,
        error: impl Into<String>,
        duration_ms: u64,
        started_at_ms: u64,
        completed_at_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            skipped: false,
            skip_reason: None,
            result: None,
            error: Some(error.into()),
            duration_ms,
            started_at_ms,
            completed_at_ms,
        }
    }

    /// A skipped step counts as successful: it was deliberately not run.
    pub fn skipped(step_id: &str, reason: impl Into<String>, at_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            skipped: true,
            skip_reason: Some(reason.into()),
            result: None,
            error: None,
            duration_ms: 0,
            started_at_ms: at_ms,
            completed_at_ms: at_ms,
        }
    }
}

/// One complete run: ephemeral, discarded after `execute` returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub flow_run_id: String,
    pub success: bool,
    pub step_results: HashMap<String, StepResult>,
    pub output: String,
    pub duration_ms: u64,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
}

/// What a step task hands back to the driver.
struct StepOutcome {
    result: StepResult,
    /// Gate feedback recorded against an upstream step id.
    feedback: Option<(String, Vec<String>)>,
}

impl StepOutcome {
    fn plain(result: StepResult) -> Self {
        Self {
            result,
            feedback: None,
        }
    }
}

/// Orchestrates flow runs against an [`AgentExecutor`].
pub struct FlowRunner {
    executor: Arc<dyn AgentExecutor>,
    gate: Arc<GateEvaluator>,
    events: Arc<dyn EventLogger>,
    transforms: Arc<TransformPipeline>,
}

impl FlowRunner {
    /// Creates a runner with the default judge (an [`ExecutorJudge`] riding
    /// the same executor) and tracing-backed events.
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        let judge = Arc::new(ExecutorJudge::new(Arc::clone(&executor)));
        Self {
            executor,
            gate: Arc::new(GateEvaluator::new(judge)),
            events: Arc::new(TracingEventLogger),
            transforms: Arc::new(TransformPipeline::new()),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn JudgeInvoker>) -> Self {
        self.gate = Arc::new(GateEvaluator::new(judge));
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    pub fn with_transforms(mut self, transforms: TransformPipeline) -> Self {
        self.transforms = Arc::new(transforms);
        self
    }

    /// Executes a flow against a request.
    ///
    /// Returns `Ok(FlowRun)` when every wave settled (even with failed
    /// steps, when `failFast` is off; the run's `success` flag reports
    /// them). Returns `Err(FlowError::Execution)` only when `failFast`
    /// truncated the run; the error carries the partial run.
    pub async fn execute(
        &self,
        flow: &FlowDefinition,
        request: &FlowRequest,
    ) -> Result<FlowRun, FlowError> {
        if flow.steps.is_empty() {
            return Err(FlowValidationError::EmptyFlow.into());
        }
        flow.validate()?;

        let resolver = DependencyResolver::new(&flow.steps)?;
        let waves = resolver.group_into_waves()?;

        let flow_run_id = Uuid::new_v4().to_string();
        let run_started = Instant::now();
        let started_at_ms = now_ms();

        let span = info_span!("flow_run", flow_id = %flow.id, run_id = %flow_run_id);
        async {
            info!(steps = flow.steps.len(), waves = waves.len(), "starting flow run");
            emit(
                self.events.as_ref(),
                "flow.started",
                json!({
                    "runId": flow_run_id,
                    "flowId": flow.id,
                    "steps": flow.steps.len(),
                    "waves": waves.len(),
                }),
            );

            let flow = Arc::new(flow.clone());
            let request = Arc::new(request.clone());
            let semaphore = flow
                .settings
                .max_parallelism
                .map(|n| Arc::new(Semaphore::new(n.max(1))));

            let mut results: HashMap<String, StepResult> = HashMap::new();
            let mut feedback: HashMap<String, Vec<String>> = HashMap::new();

            for (wave_index, wave) in waves.iter().enumerate() {
                emit(
                    self.events.as_ref(),
                    "wave.started",
                    json!({ "runId": flow_run_id, "wave": wave_index, "steps": wave }),
                );

                // Results are frozen for the duration of the wave; each
                // task reads this snapshot, and only the driver writes the
                // map after join-all.
                let snapshot = Arc::new(results.clone());
                let mut handles = Vec::new();

                for step_id in wave {
                    let step = flow
                        .step(step_id)
                        .expect("wave ids come from these steps")
                        .clone();

                    if let Some(condition) = step.condition.as_deref() {
                        let ctx = condition_context(&snapshot, &request, &flow);
                        let outcome = ConditionEvaluator::evaluate(condition, &ctx);
                        if !outcome.should_execute {
                            let reason = match outcome.error {
                                Some(e) => format!("condition failed closed: {e}"),
                                None => "condition evaluated to false".to_string(),
                            };
                            debug!(step_id = %step.id, %reason, "step skipped");
                            emit(
                                self.events.as_ref(),
                                "step.skipped",
                                json!({ "runId": flow_run_id, "stepId": step.id, "reason": reason }),
                            );
                            results.insert(
                                step.id.clone(),
                                StepResult::skipped(&step.id, reason, now_ms()),
                            );
                            continue;
                        }
                    }

                    emit(
                        self.events.as_ref(),
                        "step.started",
                        json!({
                            "runId": flow_run_id,
                            "stepId": step.id,
                            "type": step.kind.name(),
                            "wave": wave_index,
                        }),
                    );

                    let step_feedback = feedback
                        .get(&step.id)
                        .or_else(|| step.input.step_id.as_ref().and_then(|id| feedback.get(id)))
                        .cloned()
                        .unwrap_or_default();

                    let task_span =
                        info_span!("flow_step", step_id = %step.id, kind = step.kind.name());
                    let ctx = StepTaskContext {
                        flow: Arc::clone(&flow),
                        request: Arc::clone(&request),
                        snapshot: Arc::clone(&snapshot),
                        executor: Arc::clone(&self.executor),
                        gate: Arc::clone(&self.gate),
                        transforms: Arc::clone(&self.transforms),
                        semaphore: semaphore.clone(),
                    };
                    let step_id_owned = step.id.clone();
                    let handle = tokio::spawn(
                        async move { run_step(step, step_feedback, ctx).await }
                            .instrument(task_span),
                    );
                    handles.push((step_id_owned, handle));
                }

                // Join the whole wave before deciding anything. A failing
                // step does not cancel its siblings.
                for (step_id, handle) in handles {
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            let at = now_ms();
                            StepOutcome::plain(StepResult::failed(
                                &step_id,
                                format!("step task aborted: {e}"),
                                0,
                                at,
                                at,
                            ))
                        }
                    };
                    if let Some((target, issues)) = outcome.feedback {
                        feedback.entry(target).or_default().extend(issues);
                    }
                    let result = outcome.result;
                    let event = if result.success {
                        "step.completed"
                    } else {
                        "step.failed"
                    };
                    emit(
                        self.events.as_ref(),
                        event,
                        json!({
                            "runId": flow_run_id,
                            "stepId": result.step_id,
                            "success": result.success,
                            "durationMs": result.duration_ms,
                            "error": result.error,
                        }),
                    );
                    results.insert(result.step_id.clone(), result);
                }

                let failed: Vec<&StepResult> = wave
                    .iter()
                    .filter_map(|id| results.get(id))
                    .filter(|r| !r.success && !r.skipped)
                    .collect();

                emit(
                    self.events.as_ref(),
                    "wave.completed",
                    json!({
                        "runId": flow_run_id,
                        "wave": wave_index,
                        "failed": failed.len(),
                    }),
                );

                if flow.settings.fail_fast {
                    if let Some(first) = failed.first() {
                        let step_id = first.step_id.clone();
                        let message = first
                            .error
                            .clone()
                            .unwrap_or_else(|| "step failed".to_string());
                        warn!(%step_id, %message, "aborting run (failFast)");
                        emit(
                            self.events.as_ref(),
                            "flow.failed",
                            json!({
                                "runId": flow_run_id,
                                "stepId": step_id,
                                "error": message,
                            }),
                        );
                        let partial = FlowRun {
                            flow_run_id: flow_run_id.clone(),
                            success: false,
                            step_results: results,
                            output: String::new(),
                            duration_ms: run_started.elapsed().as_millis() as u64,
                            started_at_ms,
                            completed_at_ms: now_ms(),
                        };
                        return Err(FlowError::Execution {
                            flow_run_id,
                            step_id,
                            message,
                            partial: Box::new(partial),
                        });
                    }
                }
            }

            let output = aggregate_output(&flow, &results);
            emit(
                self.events.as_ref(),
                "output.aggregated",
                json!({ "runId": flow_run_id, "bytes": output.len() }),
            );

            let success = results.values().all(|r| r.success);
            let run = FlowRun {
                flow_run_id: flow_run_id.clone(),
                success,
                step_results: results,
                output,
                duration_ms: run_started.elapsed().as_millis() as u64,
                started_at_ms,
                completed_at_ms: now_ms(),
            };
            emit(
                self.events.as_ref(),
                "flow.completed",
                json!({
                    "runId": flow_run_id,
                    "success": run.success,
                    "durationMs": run.duration_ms,
                }),
            );
            info!(success = run.success, duration_ms = run.duration_ms, "flow run finished");
            Ok(run)
        }
        .instrument(span)
        .await
    }
}

/// Everything a step task needs, cheaply cloneable.
struct StepTaskContext {
    flow: Arc<FlowDefinition>,
    request: Arc<FlowRequest>,
    snapshot: Arc<HashMap<String, StepResult>>,
    executor: Arc<dyn AgentExecutor>,
    gate: Arc<GateEvaluator>,
    transforms: Arc<TransformPipeline>,
    semaphore: Option<Arc<Semaphore>>,
}

/// Runs one step to settlement. Never returns an error: every failure is
/// captured inside the returned [`StepResult`].
async fn run_step(step: StepDefinition, step_feedback: Vec<String>, ctx: StepTaskContext) -> StepOutcome {
    let started_at_ms = now_ms();
    let timer = Instant::now();

    // Bounded-concurrency launch cap; the permit is held for the whole
    // invocation.
    let _permit = match &ctx.semaphore {
        Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
        None => None,
    };

    let fail = |message: String, timer: Instant| {
        StepOutcome::plain(StepResult::failed(
            &step.id,
            message,
            timer.elapsed().as_millis() as u64,
            started_at_ms,
            now_ms(),
        ))
    };

    let input = match ctx
        .transforms
        .resolve_input(&step, &ctx.request, &ctx.snapshot, &step_feedback)
    {
        Ok(input) => input,
        Err(e) => return fail(e.to_string(), timer),
    };

    match &step.kind {
        StepKind::Agent => {
            let Some(agent) = step.agent.as_deref() else {
                return fail("agent step has no agent reference".to_string(), timer);
            };
            invoke_agent(&step.id, agent, input, &ctx, started_at_ms, timer).await
        }
        StepKind::Gate {
            evaluate,
            feedback_loop,
        } => run_gate(&step, evaluate, feedback_loop.as_ref(), input, &ctx, started_at_ms, timer).await,
        StepKind::Branch { branches, default } => {
            let context = condition_context(&ctx.snapshot, &ctx.request, &ctx.flow);
            let chosen = branches
                .iter()
                .find(|arm| ConditionEvaluator::evaluate(&arm.condition, &context).should_execute)
                .map(|arm| arm.agent.as_str())
                .or(default.as_deref());
            match chosen {
                Some(agent) => invoke_agent(&step.id, agent, input, &ctx, started_at_ms, timer).await,
                None => fail("no branch condition matched and no default set".to_string(), timer),
            }
        }
        StepKind::Consensus(consensus) => {
            let min = consensus.min_agreement.unwrap_or(consensus.agents.len());
            let calls = consensus.agents.iter().map(|agent| {
                let request = agent_request(&input, &ctx.request);
                let executor = Arc::clone(&ctx.executor);
                let agent = agent.clone();
                async move { (agent.clone(), executor.run(&agent, request).await) }
            });
            let settled = futures::future::join_all(calls).await;

            let mut sections = Vec::new();
            let mut errors = Vec::new();
            for (agent, result) in settled {
                match result {
                    Ok(response) => sections.push((agent, response.content)),
                    Err(e) => errors.push(format!("{agent}: {e}")),
                }
            }
            if sections.len() < min {
                return fail(
                    format!(
                        "consensus needs {min} responses, got {}: {}",
                        sections.len(),
                        errors.join("; ")
                    ),
                    timer,
                );
            }
            let content = sections
                .iter()
                .map(|(agent, content)| format!("## {agent}\n\n{content}"))
                .collect::<Vec<_>>()
                .join("\n\n");
            let raw = json!(
                sections
                    .iter()
                    .map(|(agent, content)| json!({ "agent": agent, "content": content }))
                    .collect::<Vec<_>>()
            );
            StepOutcome::plain(StepResult::succeeded(
                &step.id,
                AgentResponse {
                    content,
                    thought: None,
                    raw,
                },
                timer.elapsed().as_millis() as u64,
                started_at_ms,
                now_ms(),
            ))
        }
    }
}

async fn invoke_agent(
    step_id: &str,
    agent: &str,
    input: String,
    ctx: &StepTaskContext,
    started_at_ms: u64,
    timer: Instant,
) -> StepOutcome {
    let request = agent_request(&input, &ctx.request);
    match ctx.executor.run(agent, request).await {
        Ok(response) => StepOutcome::plain(StepResult::succeeded(
            step_id,
            response,
            timer.elapsed().as_millis() as u64,
            started_at_ms,
            now_ms(),
        )),
        Err(e) => StepOutcome::plain(StepResult::failed(
            step_id,
            e.to_string(),
            timer.elapsed().as_millis() as u64,
            started_at_ms,
            now_ms(),
        )),
    }
}

/// Drives the gate decision loop: evaluate, and on a retry decision
/// re-invoke the gated step's agent with the judge's issues appended, then
/// evaluate again with the next attempt index.
async fn run_gate(
    step: &StepDefinition,
    config: &crate::flow::GateConfig,
    feedback_loop: Option<&crate::flow::LoopConfig>,
    gated_content: String,
    ctx: &StepTaskContext,
    started_at_ms: u64,
    timer: Instant,
) -> StepOutcome {
    let fail = |message: String| {
        StepOutcome::plain(StepResult::failed(
            &step.id,
            message,
            timer.elapsed().as_millis() as u64,
            started_at_ms,
            now_ms(),
        ))
    };

    let target_id = match (&step.input.step_id, step.depends_on.as_slice()) {
        (Some(id), _) => id.clone(),
        (None, [only]) => only.clone(),
        _ => return fail("gate step needs a gated step (input.stepId)".to_string()),
    };

    // A loop config can only tighten the retry cap.
    let mut config = config.clone();
    if let Some(cap) = feedback_loop.and_then(|l| l.max_iterations) {
        config.max_retries = config.max_retries.min(cap);
    }

    let mut content = gated_content;
    let mut attempt_index = 0u32;
    let mut collected: Vec<String> = Vec::new();

    loop {
        let decision = match ctx
            .gate
            .evaluate(&step.id, &config, &content, None, attempt_index)
            .await
        {
            Ok(decision) => decision,
            Err(e) => return fail(e.to_string()),
        };

        match decision.action {
            GateAction::Passed => {
                return StepOutcome {
                    result: StepResult::succeeded(
                        &step.id,
                        AgentResponse {
                            raw: json!({ "evaluation": decision.evaluation }),
                            content,
                            thought: Some(decision.evaluation.summary),
                        },
                        timer.elapsed().as_millis() as u64,
                        started_at_ms,
                        now_ms(),
                    ),
                    feedback: feedback_entry(&target_id, collected),
                };
            }
            GateAction::ContinuedWithWarning => {
                warn!(step_id = %step.id, "gate continued with warning");
                return StepOutcome {
                    result: StepResult::succeeded(
                        &step.id,
                        AgentResponse {
                            raw: json!({ "evaluation": decision.evaluation }),
                            content,
                            thought: Some(format!("warning: {}", decision.evaluation.summary)),
                        },
                        timer.elapsed().as_millis() as u64,
                        started_at_ms,
                        now_ms(),
                    ),
                    feedback: feedback_entry(&target_id, collected),
                };
            }
            GateAction::Halted => {
                let mut outcome = fail(format!(
                    "gate halted after {} attempt(s): {}",
                    decision.attempts, decision.evaluation.summary
                ));
                outcome.feedback = feedback_entry(&target_id, collected);
                return outcome;
            }
            GateAction::Retry => {
                let issues = decision.feedback();
                debug!(step_id = %step.id, attempt = decision.attempts, "gate retry");
                collected.extend(issues.iter().cloned());

                let Some(target) = ctx.flow.step(&target_id) else {
                    return fail(format!("gated step '{target_id}' not found"));
                };
                let Some(agent) = target.agent.as_deref() else {
                    return fail(format!("gated step '{target_id}' has no agent to retry"));
                };
                let base = match ctx.transforms.resolve_input(
                    target,
                    &ctx.request,
                    &ctx.snapshot,
                    &[],
                ) {
                    Ok(base) => base,
                    Err(e) => return fail(e.to_string()),
                };
                let mut prompt = base;
                prompt.push_str("\n\nFeedback from quality gate:\n");
                for issue in &issues {
                    prompt.push_str("- ");
                    prompt.push_str(issue);
                    prompt.push('\n');
                }
                match ctx.executor.run(agent, agent_request(&prompt, &ctx.request)).await {
                    Ok(response) => content = response.content,
                    Err(e) => {
                        let mut outcome =
                            fail(format!("gate retry invocation failed: {e}"));
                        outcome.feedback = feedback_entry(&target_id, collected);
                        return outcome;
                    }
                }
                attempt_index += 1;
            }
        }
    }
}

fn feedback_entry(target_id: &str, collected: Vec<String>) -> Option<(String, Vec<String>)> {
    if collected.is_empty() {
        None
    } else {
        Some((target_id.to_string(), collected))
    }
}

fn agent_request(input: &str, request: &FlowRequest) -> AgentRequest {
    AgentRequest::new(input)
        .with_trace_id(request.trace_id.clone())
        .with_request_id(request.request_id.clone())
}

/// Builds the three bound context objects for condition expressions.
fn condition_context(
    results: &HashMap<String, StepResult>,
    request: &FlowRequest,
    flow: &FlowDefinition,
) -> ConditionContext {
    let mut results_json = serde_json::Map::new();
    for (id, result) in results {
        let mut entry = serde_json::Map::new();
        entry.insert("success".to_string(), json!(result.success));
        entry.insert("skipped".to_string(), json!(result.skipped));
        entry.insert("duration".to_string(), json!(result.duration_ms));
        if let Some(response) = &result.result {
            entry.insert("content".to_string(), json!(response.content));
            // `data` is the parsed-JSON form of content, when parseable.
            if let Ok(data) = serde_json::from_str::<JsonValue>(&response.content) {
                entry.insert("data".to_string(), data);
            }
        }
        if let Some(error) = &result.error {
            entry.insert("error".to_string(), json!(error));
        }
        results_json.insert(id.clone(), JsonValue::Object(entry));
    }

    let mut request_json = serde_json::Map::new();
    request_json.insert("userPrompt".to_string(), json!(request.user_prompt));
    if let Some(trace_id) = &request.trace_id {
        request_json.insert("traceId".to_string(), json!(trace_id));
    }
    if let Some(request_id) = &request.request_id {
        request_json.insert("requestId".to_string(), json!(request_id));
    }

    ConditionContext::new(
        JsonValue::Object(results_json),
        JsonValue::Object(request_json),
        json!({ "id": flow.id, "name": flow.name, "version": flow.version }),
    )
}

/// Renders the aggregated flow output from `output.from` / `output.format`.
fn aggregate_output(flow: &FlowDefinition, results: &HashMap<String, StepResult>) -> String {
    let ids = flow.output.from.ids();
    let content_of = |id: &str| {
        results
            .get(id)
            .and_then(|r| r.result.as_ref())
            .map(|r| r.content.clone())
            .unwrap_or_default()
    };

    if let [only] = ids.as_slice() {
        return content_of(only);
    }

    match flow.output.format {
        OutputFormat::Concat => ids
            .iter()
            .map(|id| content_of(id))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => {
            let mut map = serde_json::Map::new();
            for id in &ids {
                map.insert(id.to_string(), JsonValue::String(content_of(id)));
            }
            serde_json::to_string_pretty(&JsonValue::Object(map)).unwrap_or_default()
        }
        OutputFormat::Markdown => ids
            .iter()
            .map(|id| format!("## {id}\n\n{}", content_of(id)))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

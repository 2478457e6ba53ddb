//! Quality gates: scoring content against weighted criteria and deciding
//! whether a flow continues, retries, or halts.
//!
//! A gate resolves its configured criteria names against the built-in
//! library, invokes the judge capability once for per-criterion scores,
//! rolls them into a weighted overall score, and applies a two-tier pass
//! rule: the overall score must reach the configured threshold (inclusive)
//! *and* every required criterion must individually clear a fixed floor.
//! Failure routes through the `onFail` decision table. Gate outcomes are
//! ordinary decision data consumed by the runner, never errors.

pub mod criteria;

pub use criteria::EvaluationCriterion;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::error::FlowError;
use crate::executor::{AgentExecutor, AgentRequest, ExecutorError};
use crate::flow::{GateConfig, OnFailPolicy};

/// Score a required criterion must individually reach, independent of the
/// overall threshold.
pub const REQUIRED_CRITERION_FLOOR: f64 = 0.7;

/// Per-criterion judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionResult {
    pub criterion: String,
    /// 0.0 ..= 1.0.
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub passed: bool,
}

/// Rolled-up judgement for one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub overall_score: f64,
    pub passed: bool,
    pub criteria: Vec<CriterionResult>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// What the flow does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateAction {
    Passed,
    Retry,
    Halted,
    ContinuedWithWarning,
}

/// Decision returned to the runner.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub action: GateAction,
    /// Attempts consumed so far, `attempt_index + 1`.
    pub attempts: u32,
    pub evaluation: EvaluationResult,
}

impl GateDecision {
    /// Criterion issues suitable for feeding back to the gated agent on a
    /// retry.
    pub fn feedback(&self) -> Vec<String> {
        self.evaluation
            .criteria
            .iter()
            .filter(|c| !c.passed)
            .flat_map(|c| {
                if c.issues.is_empty() {
                    vec![format!("{}: scored {:.2}", c.criterion, c.score)]
                } else {
                    c.issues
                        .iter()
                        .map(|i| format!("{}: {}", c.criterion, i))
                        .collect()
                }
            })
            .collect()
    }
}

/// The judge capability: given a judge agent id, the content under review
/// and a compiled criteria prompt, produce per-criterion scores. Mock
/// implementations are used in tests; [`ExecutorJudge`] adapts any
/// [`AgentExecutor`] whose agent replies with the documented JSON shape.
#[async_trait]
pub trait JudgeInvoker: Send + Sync {
    async fn judge(
        &self,
        judge_agent: Option<&str>,
        content: &str,
        criteria_prompt: &str,
    ) -> Result<Vec<CriterionResult>, ExecutorError>;
}

/// Evaluates gate configs against content.
pub struct GateEvaluator {
    judge: Arc<dyn JudgeInvoker>,
    required_floor: f64,
}

impl GateEvaluator {
    pub fn new(judge: Arc<dyn JudgeInvoker>) -> Self {
        Self {
            judge,
            required_floor: REQUIRED_CRITERION_FLOOR,
        }
    }

    pub fn with_required_floor(mut self, floor: f64) -> Self {
        self.required_floor = floor;
        self
    }

    /// Scores `content` and applies the decision table.
    ///
    /// `attempt_index` counts prior attempts (0 on the first evaluation);
    /// the returned decision reports `attempts = attempt_index + 1`.
    pub async fn evaluate(
        &self,
        step_id: &str,
        config: &GateConfig,
        content: &str,
        context: Option<&str>,
        attempt_index: u32,
    ) -> Result<GateDecision, FlowError> {
        let selected = self.resolve_criteria(config);
        if selected.is_empty() {
            return Err(FlowError::gate(
                step_id,
                "no known criteria configured for gate",
            ));
        }

        let started = Instant::now();
        let prompt = compile_criteria_prompt(&selected, content, context);
        let raw = self
            .judge
            .judge(config.judge.as_deref(), content, &prompt)
            .await
            .map_err(|e| FlowError::gate(step_id, format!("judge invocation failed: {e}")))?;

        let scored = self.score(&selected, raw);
        let weight_sum: f64 = selected.iter().map(|c| c.weight).sum();
        let overall_score = scored
            .iter()
            .zip(selected.iter())
            .map(|(result, criterion)| result.score * criterion.weight)
            .sum::<f64>()
            / weight_sum;

        // Inclusive threshold, plus the per-criterion floor for required
        // criteria.
        let required_ok = scored
            .iter()
            .zip(selected.iter())
            .all(|(result, criterion)| !criterion.required || result.score >= self.required_floor);
        let passed = overall_score >= config.threshold && required_ok;

        let evaluation = EvaluationResult {
            overall_score,
            passed,
            summary: summarize(&scored, overall_score, passed),
            criteria: scored,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let action = if passed {
            GateAction::Passed
        } else {
            match config.on_fail {
                OnFailPolicy::Halt => GateAction::Halted,
                OnFailPolicy::ContinueWithWarning => GateAction::ContinuedWithWarning,
                OnFailPolicy::Retry => {
                    if attempt_index + 1 < config.max_retries {
                        GateAction::Retry
                    } else {
                        GateAction::Halted
                    }
                }
            }
        };

        Ok(GateDecision {
            action,
            attempts: attempt_index + 1,
            evaluation,
        })
    }

    /// Resolves criteria names. Unknown names are dropped with a warning
    /// rather than failing the gate.
    fn resolve_criteria(&self, config: &GateConfig) -> Vec<&'static EvaluationCriterion> {
        config
            .criteria
            .iter()
            .filter_map(|name| {
                let found = criteria::lookup(name);
                if found.is_none() {
                    warn!(criterion = %name, "unknown criterion dropped from gate");
                }
                found
            })
            .collect()
    }

    /// Pairs judge results with the selected criteria by order, clamping
    /// scores into range and filling the per-criterion pass flag against
    /// the floor. A judge returning fewer results than criteria scores the
    /// missing ones zero.
    fn score(
        &self,
        selected: &[&'static EvaluationCriterion],
        raw: Vec<CriterionResult>,
    ) -> Vec<CriterionResult> {
        selected
            .iter()
            .enumerate()
            .map(|(i, criterion)| {
                let mut result = raw.get(i).cloned().unwrap_or_else(|| CriterionResult {
                    criterion: criterion.name.to_string(),
                    score: 0.0,
                    reasoning: "no judgement returned".to_string(),
                    issues: vec!["judge returned no score for this criterion".to_string()],
                    passed: false,
                });
                result.criterion = criterion.name.to_string();
                result.score = result.score.clamp(0.0, 1.0);
                result.passed = result.score >= self.required_floor;
                result
            })
            .collect()
    }
}

/// Renders the criteria prompt handed to the judge.
fn compile_criteria_prompt(
    selected: &[&'static EvaluationCriterion],
    content: &str,
    context: Option<&str>,
) -> String {
    let mut prompt = String::from(
        "Evaluate the content below against each criterion. Reply with a JSON array, \
         one object per criterion in order: \
         {\"criterion\", \"score\" (0.0-1.0), \"reasoning\", \"issues\": []}.\n\nCriteria:\n",
    );
    for criterion in selected {
        prompt.push_str(&format!(
            "- {} (weight {:.1}{}): {}\n",
            criterion.name,
            criterion.weight,
            if criterion.required { ", required" } else { "" },
            criterion.description
        ));
    }
    if let Some(context) = context {
        prompt.push_str(&format!("\nContext:\n{context}\n"));
    }
    prompt.push_str(&format!("\nContent:\n{content}\n"));
    prompt
}

fn summarize(scored: &[CriterionResult], overall: f64, passed: bool) -> String {
    let failing: Vec<&str> = scored
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.criterion.as_str())
        .collect();
    if passed {
        format!("passed with overall score {overall:.2}")
    } else if failing.is_empty() {
        format!("failed with overall score {overall:.2}")
    } else {
        format!(
            "failed with overall score {overall:.2}; weak criteria: {}",
            failing.join(", ")
        )
    }
}

/// Adapts any [`AgentExecutor`] into a judge: sends the compiled criteria
/// prompt to the judge agent and parses the JSON array out of its reply.
pub struct ExecutorJudge {
    executor: Arc<dyn AgentExecutor>,
    default_judge: String,
}

impl ExecutorJudge {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            executor,
            default_judge: "judge".to_string(),
        }
    }

    pub fn with_default_judge(mut self, agent_id: impl Into<String>) -> Self {
        self.default_judge = agent_id.into();
        self
    }
}

#[async_trait]
impl JudgeInvoker for ExecutorJudge {
    async fn judge(
        &self,
        judge_agent: Option<&str>,
        _content: &str,
        criteria_prompt: &str,
    ) -> Result<Vec<CriterionResult>, ExecutorError> {
        let agent_id = judge_agent.unwrap_or(&self.default_judge);
        let response = self
            .executor
            .run(agent_id, AgentRequest::new(criteria_prompt))
            .await?;

        let text = response.content.trim();
        // Prefer a fenced ```json block when the judge wraps its reply in
        // markdown; otherwise tolerate prose around a bare array.
        let fenced = regex::Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```")
            .ok()
            .and_then(|re| re.captures(text).map(|c| c[1].to_string()));
        let json_slice = match &fenced {
            Some(block) => block.as_str(),
            None => match (text.find('['), text.rfind(']')) {
                (Some(start), Some(end)) if start < end => &text[start..=end],
                _ => {
                    return Err(ExecutorError::ParseError(
                        "judge reply contains no JSON array".to_string(),
                    ));
                }
            },
        };
        serde_json::from_str(json_slice).map_err(|e| ExecutorError::ParseError(e.to_string()))
    }
}

/// Deterministic judge for tests: replays scripted score vectors, the last
/// one repeating once the script is exhausted.
pub struct ScriptedJudge {
    scripts: std::sync::Mutex<std::collections::VecDeque<Vec<f64>>>,
}

impl ScriptedJudge {
    pub fn new(scripts: Vec<Vec<f64>>) -> Self {
        Self {
            scripts: std::sync::Mutex::new(scripts.into_iter().collect()),
        }
    }

    /// Scores every criterion with the same value on every call.
    pub fn uniform(score: f64) -> Self {
        Self::new(vec![vec![score; 16]])
    }
}

#[async_trait]
impl JudgeInvoker for ScriptedJudge {
    async fn judge(
        &self,
        _judge_agent: Option<&str>,
        _content: &str,
        _criteria_prompt: &str,
    ) -> Result<Vec<CriterionResult>, ExecutorError> {
        let scores = {
            let mut scripts = self.scripts.lock().expect("judge scripts poisoned");
            if scripts.len() > 1 {
                scripts.pop_front().unwrap_or_default()
            } else {
                scripts.front().cloned().unwrap_or_default()
            }
        };
        Ok(scores
            .into_iter()
            .map(|score| CriterionResult {
                criterion: String::new(),
                score,
                reasoning: format!("scripted score {score:.2}"),
                issues: if score < REQUIRED_CRITERION_FLOOR {
                    vec![format!("scripted issue at {score:.2}")]
                } else {
                    Vec::new()
                },
                passed: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(criteria: Vec<&str>, threshold: f64, on_fail: OnFailPolicy, max_retries: u32) -> GateConfig {
        GateConfig {
            judge: None,
            criteria: criteria.into_iter().map(String::from).collect(),
            threshold,
            on_fail,
            max_retries,
        }
    }

    fn evaluator(scores: Vec<Vec<f64>>) -> GateEvaluator {
        GateEvaluator::new(Arc::new(ScriptedJudge::new(scores)))
    }

    #[tokio::test]
    async fn test_score_equal_to_threshold_passes() {
        let gate = evaluator(vec![vec![0.8, 0.8]]);
        let config = config(vec!["accuracy", "clarity"], 0.8, OnFailPolicy::Halt, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        assert!((decision.evaluation.overall_score - 0.8).abs() < 1e-9);
        assert!(decision.evaluation.passed);
        assert_eq!(decision.action, GateAction::Passed);
    }

    #[tokio::test]
    async fn test_weighted_overall_score() {
        // accuracy weight 1.0, clarity weight 0.6.
        let gate = evaluator(vec![vec![1.0, 0.0]]);
        let config = config(vec!["accuracy", "clarity"], 0.5, OnFailPolicy::Halt, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        let expected = 1.0 / 1.6;
        assert!((decision.evaluation.overall_score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_required_criterion_floor() {
        // High overall, but required accuracy scores below the 0.7 floor.
        let gate = evaluator(vec![vec![0.6, 1.0]]);
        let config = config(vec!["accuracy", "clarity"], 0.5, OnFailPolicy::Halt, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        assert!(decision.evaluation.overall_score >= 0.5);
        assert!(!decision.evaluation.passed);
        assert_eq!(decision.action, GateAction::Halted);
    }

    #[tokio::test]
    async fn test_retry_decision_table() {
        let config = config(vec!["accuracy"], 0.9, OnFailPolicy::Retry, 3);
        for (attempt_index, expected) in [
            (0, GateAction::Retry),
            (1, GateAction::Retry),
            (2, GateAction::Halted),
        ] {
            let gate = evaluator(vec![vec![0.2]]);
            let decision = gate
                .evaluate("g", &config, "content", None, attempt_index)
                .await
                .unwrap();
            assert_eq!(decision.action, expected, "attempt_index {attempt_index}");
            assert_eq!(decision.attempts, attempt_index + 1);
        }
    }

    #[tokio::test]
    async fn test_pass_overrides_on_fail() {
        let gate = evaluator(vec![vec![1.0]]);
        let config = config(vec!["accuracy"], 0.5, OnFailPolicy::Halt, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        assert_eq!(decision.action, GateAction::Passed);
    }

    #[tokio::test]
    async fn test_continue_with_warning() {
        let gate = evaluator(vec![vec![0.1]]);
        let config = config(vec!["accuracy"], 0.9, OnFailPolicy::ContinueWithWarning, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        assert_eq!(decision.action, GateAction::ContinuedWithWarning);
    }

    #[tokio::test]
    async fn test_unknown_criteria_dropped_not_fatal() {
        let gate = evaluator(vec![vec![1.0]]);
        let config = config(vec!["accuracy", "vibes"], 0.5, OnFailPolicy::Halt, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        assert_eq!(decision.evaluation.criteria.len(), 1);
        assert_eq!(decision.evaluation.criteria[0].criterion, "accuracy");
    }

    #[tokio::test]
    async fn test_all_criteria_unknown_is_error() {
        let gate = evaluator(vec![vec![1.0]]);
        let config = config(vec!["vibes"], 0.5, OnFailPolicy::Halt, 3);
        let err = gate.evaluate("g", &config, "content", None, 0).await.unwrap_err();
        assert!(err.to_string().contains("no known criteria"));
    }

    #[tokio::test]
    async fn test_feedback_lists_failing_criteria() {
        let gate = evaluator(vec![vec![0.2]]);
        let config = config(vec!["accuracy"], 0.9, OnFailPolicy::Retry, 3);
        let decision = gate.evaluate("g", &config, "content", None, 0).await.unwrap();
        let feedback = decision.feedback();
        assert!(!feedback.is_empty());
        assert!(feedback[0].starts_with("accuracy:"));
    }

    #[tokio::test]
    async fn test_executor_judge_parses_array() {
        use crate::executor::MockExecutor;

        let reply = r#"Here is my verdict:
[
  { "criterion": "accuracy", "score": 0.9, "reasoning": "solid", "issues": [] }
]"#;
        let executor = Arc::new(MockExecutor::new().with_response("judge", reply));
        let judge = ExecutorJudge::new(executor);
        let results = judge.judge(None, "content", "prompt").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_executor_judge_unwraps_code_fence() {
        use crate::executor::MockExecutor;

        let reply = "```json\n[ { \"criterion\": \"accuracy\", \"score\": 0.4 } ]\n```";
        let executor = Arc::new(MockExecutor::new().with_response("judge", reply));
        let judge = ExecutorJudge::new(executor);
        let results = judge.judge(None, "content", "prompt").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_executor_judge_rejects_non_json() {
        use crate::executor::MockExecutor;

        let executor = Arc::new(MockExecutor::new().with_response("judge", "no json here"));
        let judge = ExecutorJudge::new(executor);
        let err = judge.judge(None, "content", "prompt").await.unwrap_err();
        assert!(matches!(err, ExecutorError::ParseError(_)));
    }
}

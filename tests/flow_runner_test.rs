//! Integration tests for FlowRunner
//!
//! These tests drive whole flow definitions through the runner with
//! deterministic mock agents: wave ordering, failure policies, conditions,
//! gates, branches, consensus and output aggregation.

use agent_flow::{
    EventLogger, FlowDefinition, FlowError, FlowRequest, FlowRunner, FlowValidationError,
    MockExecutor, NullEventLogger, ScriptedJudge,
};
use serde_json::{Value as JsonValue, json};
use std::sync::{Arc, Mutex};

fn flow(json: &str) -> FlowDefinition {
    FlowDefinition::from_json(json).expect("flow definition should parse")
}

fn runner_with(mock: Arc<MockExecutor>) -> FlowRunner {
    FlowRunner::new(mock).with_events(Arc::new(NullEventLogger))
}

/// Event sink that records event names in arrival order.
struct CollectingEvents(Mutex<Vec<String>>);

impl EventLogger for CollectingEvents {
    fn log(&self, event: &str, _payload: JsonValue) {
        self.0.lock().unwrap().push(event.to_string());
    }
}

// ============================================================================
// Pipelines and waves
// ============================================================================

#[tokio::test]
async fn test_linear_pipeline_threads_content_downstream() {
    let definition = flow(
        r#"{
            "id": "article",
            "name": "Article pipeline",
            "steps": [
                { "id": "outline", "agent": "planner" },
                { "id": "draft", "agent": "writer", "dependsOn": ["outline"],
                  "input": { "source": "step", "stepId": "outline" } }
            ],
            "output": { "from": "draft" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new());
    let runner = runner_with(mock.clone());
    let run = runner
        .execute(&definition, &FlowRequest::new("write about crabs"))
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.step_results.len(), 2);
    // The echo executor makes the threading visible in the final content.
    assert_eq!(run.output, "[writer] [planner] write about crabs");

    let invocations = mock.invocations();
    assert_eq!(invocations[0].0, "planner");
    assert_eq!(invocations[1].0, "writer");
}

#[tokio::test]
async fn test_diamond_runs_waves_in_order() {
    let definition = flow(
        r#"{
            "id": "diamond",
            "name": "diamond",
            "steps": [
                { "id": "root", "agent": "a" },
                { "id": "left", "agent": "b", "dependsOn": ["root"] },
                { "id": "right", "agent": "c", "dependsOn": ["root"] },
                { "id": "merge", "agent": "d", "dependsOn": ["left", "right"],
                  "input": { "source": "aggregate", "from": ["left", "right"] } }
            ],
            "output": { "from": "merge" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new());
    let runner = runner_with(mock.clone());
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    let order: Vec<String> = mock.invocations().into_iter().map(|(a, _)| a).collect();
    assert_eq!(order[0], "a");
    assert_eq!(order[3], "d");
    // left/right share a wave; their relative order is not fixed.
    assert!(order[1..3].contains(&"b".to_string()));
    assert!(order[1..3].contains(&"c".to_string()));
}

#[tokio::test]
async fn test_cycle_is_rejected_before_execution() {
    let definition = flow(
        r#"{
            "id": "cyclic",
            "name": "cyclic",
            "steps": [
                { "id": "a", "agent": "x", "dependsOn": ["b"] },
                { "id": "b", "agent": "x", "dependsOn": ["a"] }
            ],
            "output": { "from": "a" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new());
    let runner = runner_with(mock.clone());
    let err = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap_err();

    match err {
        FlowError::Validation(FlowValidationError::CycleDetected { path }) => {
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected cycle error, got {other}"),
    }
    assert!(mock.invocations().is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_fails_before_any_wave() {
    let definition = flow(
        r#"{
            "id": "broken",
            "name": "broken",
            "steps": [ { "id": "a", "agent": "x", "dependsOn": ["ghost"] } ],
            "output": { "from": "a" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new());
    let runner = runner_with(mock.clone());
    let err = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FlowError::Validation(FlowValidationError::UnknownDependency { .. })
    ));
    assert!(mock.invocations().is_empty());
}

// ============================================================================
// Failure policies
// ============================================================================

#[tokio::test]
async fn test_fail_fast_truncates_run_after_wave_settles() {
    let definition = flow(
        r#"{
            "id": "ff",
            "name": "ff",
            "steps": [
                { "id": "a", "agent": "ok" },
                { "id": "b", "agent": "broken" },
                { "id": "c", "agent": "ok", "dependsOn": ["a"] }
            ],
            "output": { "from": "c" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new().with_failure("broken", "boom"));
    let runner = runner_with(mock.clone());
    let err = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap_err();

    match err {
        FlowError::Execution {
            step_id, partial, ..
        } => {
            assert_eq!(step_id, "b");
            assert!(!partial.success);
            // The failing wave still settled completely: a succeeded.
            assert!(partial.step_results["a"].success);
            assert!(!partial.step_results["b"].success);
            // c never ran.
            assert!(!partial.step_results.contains_key("c"));
        }
        other => panic!("expected execution error, got {other}"),
    }
    // Only wave 0 agents were invoked.
    assert_eq!(mock.invocations().len(), 2);
}

#[tokio::test]
async fn test_fail_fast_off_cascades_missing_upstream() {
    let definition = flow(
        r#"{
            "id": "cascade",
            "name": "cascade",
            "steps": [
                { "id": "a", "agent": "ok" },
                { "id": "b", "agent": "broken" },
                { "id": "c", "agent": "merge", "dependsOn": ["a", "b"],
                  "input": { "source": "aggregate", "from": ["a", "b"] } }
            ],
            "output": { "from": "c" },
            "settings": { "failFast": false }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new().with_failure("broken", "boom"));
    let runner = runner_with(mock.clone());
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(!run.success);
    assert_eq!(run.step_results.len(), 3);
    assert!(run.step_results["a"].success);
    assert!(!run.step_results["b"].success);
    // c was attempted and failed on the missing upstream content.
    let c = &run.step_results["c"];
    assert!(!c.success);
    assert!(!c.skipped);
    assert!(
        c.error
            .as_deref()
            .unwrap()
            .contains("missing upstream result")
    );
    // The merge agent itself was never reached.
    assert!(mock.invocations().iter().all(|(agent, _)| agent != "merge"));
}

// ============================================================================
// Conditions
// ============================================================================

#[tokio::test]
async fn test_false_condition_skips_without_invoking_agent() {
    let definition = flow(
        r#"{
            "id": "cond",
            "name": "cond",
            "steps": [
                { "id": "a", "agent": "x" },
                { "id": "b", "agent": "never", "dependsOn": ["a"],
                  "condition": "results['a'].success == false" }
            ],
            "output": { "from": "a" },
            "settings": { "failFast": false }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new());
    let runner = runner_with(mock.clone());
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    let b = &run.step_results["b"];
    assert!(b.skipped);
    assert!(b.success);
    assert_eq!(b.skip_reason.as_deref(), Some("condition evaluated to false"));
    assert!(mock.invocations().iter().all(|(agent, _)| agent != "never"));
}

#[tokio::test]
async fn test_broken_condition_fails_closed_into_skip() {
    let definition = flow(
        r#"{
            "id": "cond",
            "name": "cond",
            "steps": [
                { "id": "a", "agent": "x" },
                { "id": "b", "agent": "never", "dependsOn": ["a"],
                  "condition": "results['ghost'].success" }
            ],
            "output": { "from": "a" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    let b = &run.step_results["b"];
    assert!(b.skipped);
    assert!(b.skip_reason.as_deref().unwrap().contains("failed closed"));
}

// ============================================================================
// Gates
// ============================================================================

#[tokio::test]
async fn test_gate_passes_and_reports_content() {
    let definition = flow(
        r#"{
            "id": "gated",
            "name": "gated",
            "steps": [
                { "id": "draft", "agent": "writer" },
                { "id": "check", "type": "gate", "dependsOn": ["draft"],
                  "input": { "source": "step", "stepId": "draft" },
                  "evaluate": { "criteria": ["accuracy", "clarity"], "threshold": 0.8 } }
            ],
            "output": { "from": "check" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new().with_response("writer", "the draft"));
    let runner = runner_with(mock).with_judge(Arc::new(ScriptedJudge::uniform(0.9)));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.output, "the draft");
    let check = &run.step_results["check"];
    assert!(check.result.as_ref().unwrap().thought.is_some());
}

#[tokio::test]
async fn test_gate_retry_feeds_issues_back_to_agent() {
    let definition = flow(
        r#"{
            "id": "gated",
            "name": "gated",
            "steps": [
                { "id": "draft", "agent": "writer" },
                { "id": "check", "type": "gate", "dependsOn": ["draft"],
                  "input": { "source": "step", "stepId": "draft" },
                  "evaluate": { "criteria": ["accuracy"], "threshold": 0.8,
                                "onFail": "retry", "maxRetries": 3 } }
            ],
            "output": { "from": "check" }
        }"#,
    );

    let mock = Arc::new(MockExecutor::new().with_sequence("writer", vec!["rough", "polished"]));
    let runner = runner_with(mock.clone())
        .with_judge(Arc::new(ScriptedJudge::new(vec![vec![0.2], vec![0.95]])));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    // The gate's content follows the retried invocation; the original
    // draft result stays immutable.
    assert_eq!(run.output, "polished");
    assert_eq!(
        run.step_results["draft"].result.as_ref().unwrap().content,
        "rough"
    );

    let writer_prompts: Vec<String> = mock
        .invocations()
        .into_iter()
        .filter(|(agent, _)| agent == "writer")
        .map(|(_, prompt)| prompt)
        .collect();
    assert_eq!(writer_prompts.len(), 2);
    assert!(writer_prompts[1].contains("Feedback from quality gate"));
}

#[tokio::test]
async fn test_gate_halts_when_retries_exhausted() {
    let definition = flow(
        r#"{
            "id": "gated",
            "name": "gated",
            "steps": [
                { "id": "draft", "agent": "writer" },
                { "id": "check", "type": "gate", "dependsOn": ["draft"],
                  "input": { "source": "step", "stepId": "draft" },
                  "evaluate": { "criteria": ["accuracy"], "threshold": 0.9,
                                "onFail": "retry", "maxRetries": 2 } }
            ],
            "output": { "from": "check" },
            "settings": { "failFast": false }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()))
        .with_judge(Arc::new(ScriptedJudge::uniform(0.1)));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(!run.success);
    let check = &run.step_results["check"];
    assert!(!check.success);
    assert!(check.error.as_deref().unwrap().contains("gate halted after 2"));
}

#[tokio::test]
async fn test_gate_continue_with_warning_keeps_run_green() {
    let definition = flow(
        r#"{
            "id": "gated",
            "name": "gated",
            "steps": [
                { "id": "draft", "agent": "writer" },
                { "id": "check", "type": "gate", "dependsOn": ["draft"],
                  "input": { "source": "step", "stepId": "draft" },
                  "evaluate": { "criteria": ["accuracy"], "threshold": 0.9,
                                "onFail": "continue-with-warning" } }
            ],
            "output": { "from": "check" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()))
        .with_judge(Arc::new(ScriptedJudge::uniform(0.1)));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    let thought = run.step_results["check"]
        .result
        .as_ref()
        .unwrap()
        .thought
        .clone()
        .unwrap();
    assert!(thought.starts_with("warning:"));
}

// ============================================================================
// Branch and consensus
// ============================================================================

#[tokio::test]
async fn test_branch_picks_first_matching_arm() {
    let definition = flow(
        r#"{
            "id": "branching",
            "name": "branching",
            "steps": [
                { "id": "route", "type": "branch",
                  "branches": [
                    { "condition": "request.userPrompt.includes('short')", "agent": "summarizer" },
                    { "condition": "true", "agent": "long_writer" }
                  ],
                  "default": "long_writer" }
            ],
            "output": { "from": "route" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("keep it short"))
        .await
        .unwrap();
    assert_eq!(run.output, "[summarizer] keep it short");

    let run = runner
        .execute(&definition, &FlowRequest::new("full essay please"))
        .await
        .unwrap();
    assert_eq!(run.output, "[long_writer] full essay please");
}

#[tokio::test]
async fn test_branch_without_match_or_default_fails() {
    let definition = flow(
        r#"{
            "id": "branching",
            "name": "branching",
            "steps": [
                { "id": "route", "type": "branch",
                  "branches": [ { "condition": "false", "agent": "x" } ] }
            ],
            "output": { "from": "route" },
            "settings": { "failFast": false }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();
    let route = &run.step_results["route"];
    assert!(!route.success);
    assert!(route.error.as_deref().unwrap().contains("no branch condition matched"));
}

#[tokio::test]
async fn test_consensus_merges_sections_per_agent() {
    let definition = flow(
        r#"{
            "id": "panel",
            "name": "panel",
            "steps": [
                { "id": "review", "type": "consensus",
                  "consensus": { "agents": ["critic", "editor"] } }
            ],
            "output": { "from": "review" }
        }"#,
    );

    let mock = Arc::new(
        MockExecutor::new()
            .with_response("critic", "needs work")
            .with_response("editor", "tighten prose"),
    );
    let runner = runner_with(mock);
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    assert!(run.output.contains("## critic\n\nneeds work"));
    assert!(run.output.contains("## editor\n\ntighten prose"));
}

#[tokio::test]
async fn test_consensus_min_agreement_tolerates_failures() {
    let definition = flow(
        r#"{
            "id": "panel",
            "name": "panel",
            "steps": [
                { "id": "review", "type": "consensus",
                  "consensus": { "agents": ["critic", "flaky"], "minAgreement": 1 } }
            ],
            "output": { "from": "review" }
        }"#,
    );

    let mock = Arc::new(
        MockExecutor::new()
            .with_response("critic", "fine")
            .with_failure("flaky", "offline"),
    );
    let runner = runner_with(mock);
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    assert!(run.success);
    assert!(run.output.contains("## critic"));
    assert!(!run.output.contains("## flaky"));
}

// ============================================================================
// Output aggregation and determinism
// ============================================================================

#[tokio::test]
async fn test_json_output_keys_match_step_ids() {
    let definition = flow(
        r#"{
            "id": "agg",
            "name": "agg",
            "steps": [
                { "id": "a", "agent": "x" },
                { "id": "b", "agent": "y" }
            ],
            "output": { "from": ["a", "b"], "format": "json" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    let parsed: JsonValue = serde_json::from_str(&run.output).unwrap();
    let keys: Vec<&String> = parsed.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["a", "b"]);
}

#[tokio::test]
async fn test_repeated_runs_are_byte_identical() {
    let definition = flow(
        r#"{
            "id": "det",
            "name": "det",
            "steps": [
                { "id": "a", "agent": "x" },
                { "id": "b", "agent": "y", "dependsOn": ["a"],
                  "input": { "source": "step", "stepId": "a" } }
            ],
            "output": { "from": ["a", "b"], "format": "markdown" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let first = runner
        .execute(&definition, &FlowRequest::new("same prompt"))
        .await
        .unwrap();
    let second = runner
        .execute(&definition, &FlowRequest::new("same prompt"))
        .await
        .unwrap();

    assert_eq!(first.output, second.output);
    for (id, result) in &first.step_results {
        let other = &second.step_results[id];
        assert_eq!(
            result.result.as_ref().map(|r| &r.content),
            other.result.as_ref().map(|r| &r.content)
        );
        assert_eq!(result.success, other.success);
    }
    // Run ids differ per run.
    assert_ne!(first.flow_run_id, second.flow_run_id);
}

#[tokio::test]
async fn test_max_parallelism_still_completes_wave() {
    let definition = flow(
        r#"{
            "id": "capped",
            "name": "capped",
            "steps": [
                { "id": "a", "agent": "x" },
                { "id": "b", "agent": "x" },
                { "id": "c", "agent": "x" }
            ],
            "output": { "from": ["a", "b", "c"], "format": "concat" },
            "settings": { "maxParallelism": 1 }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();
    assert!(run.success);
    assert_eq!(run.step_results.len(), 3);
}

// ============================================================================
// Events and trace propagation
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events_bracket_the_run() {
    let definition = flow(
        r#"{
            "id": "ev",
            "name": "ev",
            "steps": [ { "id": "a", "agent": "x" } ],
            "output": { "from": "a" }
        }"#,
    );

    let events = Arc::new(CollectingEvents(Mutex::new(Vec::new())));
    let runner = FlowRunner::new(Arc::new(MockExecutor::new())).with_events(events.clone());
    runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();

    let seen = events.0.lock().unwrap().clone();
    assert_eq!(seen.first().map(String::as_str), Some("flow.started"));
    assert_eq!(seen.last().map(String::as_str), Some("flow.completed"));
    for expected in ["wave.started", "step.started", "step.completed", "output.aggregated"] {
        assert!(seen.contains(&expected.to_string()), "missing {expected}");
    }
}

#[tokio::test]
async fn test_empty_flow_is_rejected() {
    let definition = flow(
        r#"{ "id": "e", "name": "e", "steps": [], "output": { "from": [] } }"#,
    );
    let runner = runner_with(Arc::new(MockExecutor::new()));
    let err = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Validation(FlowValidationError::EmptyFlow)
    ));
}

#[tokio::test]
async fn test_flow_loads_from_file_on_disk() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "id": "disk",
            "name": "disk",
            "steps": [ {{ "id": "a", "agent": "x" }} ],
            "output": {{ "from": "a" }}
        }}"#
    )
    .unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let definition = FlowDefinition::from_json(&text).unwrap();
    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go"))
        .await
        .unwrap();
    assert_eq!(run.output, "[x] go");
}

#[tokio::test]
async fn test_run_serializes_to_json() {
    let definition = flow(
        r#"{
            "id": "ser",
            "name": "ser",
            "steps": [ { "id": "a", "agent": "x" } ],
            "output": { "from": "a" }
        }"#,
    );

    let runner = runner_with(Arc::new(MockExecutor::new()));
    let run = runner
        .execute(&definition, &FlowRequest::new("go").with_trace_id("t-1"))
        .await
        .unwrap();

    let serialized = serde_json::to_value(&run).unwrap();
    assert_eq!(serialized["success"], json!(true));
    assert!(serialized["stepResults"]["a"]["result"]["content"].is_string());
}

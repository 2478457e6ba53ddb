//! Step-condition evaluation.
//!
//! Conditions gate step execution with a boolean expression over exactly
//! three bound names: `results`, `request` and `flow`. The evaluator fails
//! closed: any lex, parse or evaluation error yields `should_execute =
//! false` with the error captured, and the public entry point never panics
//! or returns an error. A broken condition skips the step rather than
//! crashing the run.

pub mod expr;

pub use expr::ConditionError;

use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;

/// The three context objects reachable from a condition expression. No
/// ambient state and no I/O is exposed beyond these.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    /// `results`: step id -> `{success, skipped, content?, data?, duration, error?}`.
    pub results: JsonValue,
    /// `request`: `{userPrompt, traceId?, requestId?}`.
    pub request: JsonValue,
    /// `flow`: `{id, name, version}`.
    pub flow: JsonValue,
}

impl ConditionContext {
    pub fn new(results: JsonValue, request: JsonValue, flow: JsonValue) -> Self {
        Self {
            results,
            request,
            flow,
        }
    }

    /// A fixed context used to exercise expressions at authoring time,
    /// independent of any real run.
    pub fn placeholder() -> Self {
        Self {
            results: json!({}),
            request: json!({ "userPrompt": "" }),
            flow: json!({ "id": "", "name": "", "version": "" }),
        }
    }

    fn bindings(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::with_capacity(3);
        map.insert("results".to_string(), self.results.clone());
        map.insert("request".to_string(), self.request.clone());
        map.insert("flow".to_string(), self.flow.clone());
        map
    }
}

/// Result of evaluating a step condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub should_execute: bool,
    /// Captured evaluation error, if the condition failed closed.
    pub error: Option<String>,
}

impl ConditionOutcome {
    fn execute() -> Self {
        Self {
            should_execute: true,
            error: None,
        }
    }

    fn skip() -> Self {
        Self {
            should_execute: false,
            error: None,
        }
    }

    fn failed_closed(error: String) -> Self {
        Self {
            should_execute: false,
            error: Some(error),
        }
    }
}

/// Evaluates step conditions against a delimited context.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Decides whether a step should execute.
    ///
    /// An empty or whitespace-only condition means `should_execute = true`
    /// without any evaluation. Errors never propagate: they are captured in
    /// the outcome and the step is skipped.
    pub fn evaluate(condition: &str, ctx: &ConditionContext) -> ConditionOutcome {
        if condition.trim().is_empty() {
            return ConditionOutcome::execute();
        }

        let expr = match expr::parse(condition) {
            Ok(expr) => expr,
            Err(e) => return ConditionOutcome::failed_closed(e.to_string()),
        };

        let bindings = ctx.bindings();
        let mut scope = expr::Scope::new(&bindings);
        match expr::eval(&expr, &mut scope) {
            Ok(value) => {
                if expr::truthy(&value) {
                    ConditionOutcome::execute()
                } else {
                    ConditionOutcome::skip()
                }
            }
            Err(e) => ConditionOutcome::failed_closed(e.to_string()),
        }
    }

    /// Surfaces syntax errors at authoring time by running the same
    /// parser against a placeholder context. Evaluation errors (such as
    /// step ids that do not exist yet) are not reported here.
    pub fn validate_condition(condition: &str) -> Result<(), ConditionError> {
        if condition.trim().is_empty() {
            return Ok(());
        }
        let expr = expr::parse(condition)?;
        let ctx = ConditionContext::placeholder();
        let bindings = ctx.bindings();
        let mut scope = expr::Scope::new(&bindings);
        // Runtime errors against the placeholder are expected; only the
        // parse outcome decides validity.
        let _ = expr::eval(&expr, &mut scope);
        Ok(())
    }
}

//! Structured run events.
//!
//! Every transition in a run (wave and step lifecycle, output aggregation,
//! run completion) is reported to an [`EventLogger`]. Events are purely
//! observational: a logger failure must never affect control flow, so the
//! runner shields every call.

use serde_json::Value as JsonValue;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Fire-and-forget event sink.
pub trait EventLogger: Send + Sync {
    fn log(&self, event: &str, payload: JsonValue);
}

/// Default sink: forwards events to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingEventLogger;

impl EventLogger for TracingEventLogger {
    fn log(&self, event: &str, payload: JsonValue) {
        tracing::info!(target: "agent_flow::events", event, %payload);
    }
}

/// Discards everything. Useful in tests that assert on results alone.
#[derive(Debug, Default)]
pub struct NullEventLogger;

impl EventLogger for NullEventLogger {
    fn log(&self, _event: &str, _payload: JsonValue) {}
}

/// Invokes the logger, swallowing panics so observability can never abort
/// the run.
pub(crate) fn emit(logger: &dyn EventLogger, event: &str, payload: JsonValue) {
    let result = catch_unwind(AssertUnwindSafe(|| logger.log(event, payload)));
    if result.is_err() {
        tracing::warn!(event, "event logger panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Collecting(Mutex<Vec<String>>);

    impl EventLogger for Collecting {
        fn log(&self, event: &str, _payload: JsonValue) {
            self.0.lock().unwrap().push(event.to_string());
        }
    }

    struct Panicking;

    impl EventLogger for Panicking {
        fn log(&self, _event: &str, _payload: JsonValue) {
            panic!("broken sink");
        }
    }

    #[test]
    fn test_emit_forwards_event() {
        let logger = Collecting(Mutex::new(Vec::new()));
        emit(&logger, "step.started", json!({ "stepId": "a" }));
        assert_eq!(*logger.0.lock().unwrap(), vec!["step.started".to_string()]);
    }

    #[test]
    fn test_emit_survives_panicking_logger() {
        emit(&Panicking, "flow.completed", json!({}));
    }
}

//! The agent-invocation seam.
//!
//! The runner consumes agents only through the [`AgentExecutor`] trait:
//! provider identity, transport retries and backoff live below this
//! boundary and stay opaque to the orchestration engine. A deterministic
//! [`MockExecutor`] ships for tests and dry runs, and a [`CommandExecutor`]
//! spawns an agent CLI per invocation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors surfaced by an agent invocation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("no agent found with id: {0}")]
    AgentNotFound(String),

    #[error("failed to parse agent output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent error: {0}")]
    Other(String),
}

/// One invocation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub user_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AgentRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// One invocation result. The runner consumes only `content`; `thought`
/// and `raw` ride along for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default)]
    pub raw: JsonValue,
}

impl AgentResponse {
    pub fn from_content(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            raw: JsonValue::String(content.clone()),
            content,
            thought: None,
        }
    }
}

/// Asynchronous agent invocation. Implementations must be cheap to share
/// across waves (`Send + Sync`); all per-call state belongs in the request.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, agent_id: &str, request: AgentRequest)
    -> Result<AgentResponse, ExecutorError>;
}

enum MockBehavior {
    /// Fixed reply for every invocation.
    Fixed(String),
    /// Scripted replies consumed in order; the last one repeats.
    Sequence(Mutex<VecDeque<String>>),
    Fail(String),
}

/// Deterministic in-memory executor.
///
/// Unscripted agents echo `[{agent_id}] {prompt}`, which keeps repeated
/// runs byte-identical. Every invocation is appended to an inspectable log.
#[derive(Default)]
pub struct MockExecutor {
    behaviors: HashMap<String, MockBehavior>,
    log: Mutex<Vec<(String, String)>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a fixed reply for an agent.
    pub fn with_response(mut self, agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        self.behaviors
            .insert(agent_id.into(), MockBehavior::Fixed(content.into()));
        self
    }

    /// Scripts a sequence of replies; once exhausted the last reply repeats.
    pub fn with_sequence(
        mut self,
        agent_id: impl Into<String>,
        contents: Vec<impl Into<String>>,
    ) -> Self {
        let queue = contents.into_iter().map(Into::into).collect();
        self.behaviors
            .insert(agent_id.into(), MockBehavior::Sequence(Mutex::new(queue)));
        self
    }

    /// Makes every invocation of an agent fail.
    pub fn with_failure(mut self, agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.behaviors
            .insert(agent_id.into(), MockBehavior::Fail(message.into()));
        self
    }

    /// Invocations recorded so far as `(agent_id, user_prompt)` pairs.
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.log.lock().expect("mock log poisoned").clone()
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn run(
        &self,
        agent_id: &str,
        request: AgentRequest,
    ) -> Result<AgentResponse, ExecutorError> {
        self.log
            .lock()
            .expect("mock log poisoned")
            .push((agent_id.to_string(), request.user_prompt.clone()));

        match self.behaviors.get(agent_id) {
            Some(MockBehavior::Fixed(content)) => Ok(AgentResponse::from_content(content.clone())),
            Some(MockBehavior::Sequence(queue)) => {
                let mut queue = queue.lock().expect("mock queue poisoned");
                let content = if queue.len() > 1 {
                    queue.pop_front().unwrap_or_default()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                Ok(AgentResponse::from_content(content))
            }
            Some(MockBehavior::Fail(message)) => {
                Err(ExecutorError::ExecutionFailed(message.clone()))
            }
            None => Ok(AgentResponse::from_content(format!(
                "[{agent_id}] {}",
                request.user_prompt
            ))),
        }
    }
}

/// Spawns an agent CLI per invocation: the prompt goes to stdin, stdout
/// becomes the response content. The agent id is passed as the first
/// argument.
pub struct CommandExecutor {
    program: String,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn run(
        &self,
        agent_id: &str,
        request: AgentRequest,
    ) -> Result<AgentResponse, ExecutorError> {
        let mut child = tokio::process::Command::new(&self.program)
            .arg(agent_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.user_prompt.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::ExecutionFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let content = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        Ok(AgentResponse {
            raw: json!({ "stdout": content }),
            content,
            thought: None,
        })
    }
}

/// Carries the endpoint of an HTTP-backed agent service through provider
/// configuration. No transport is wired up at this boundary: every
/// invocation reports a failure naming the endpoint, so a misconfigured
/// provider surfaces as an ordinary step failure rather than a spawn of
/// some unrelated program.
pub struct HttpExecutor {
    endpoint: String,
}

impl HttpExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AgentExecutor for HttpExecutor {
    async fn run(
        &self,
        agent_id: &str,
        _request: AgentRequest,
    ) -> Result<AgentResponse, ExecutorError> {
        Err(ExecutorError::ExecutionFailed(format!(
            "no http transport available for agent '{agent_id}' at {}",
            self.endpoint
        )))
    }
}

/// Provider selection for the executor, resolved with the priority
/// environment > named config > default. Each variant holds only its own
/// required fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorProvider {
    Mock,
    Command { program: String },
    Http { endpoint: String },
}

/// Environment variable consulted first during provider resolution.
pub const PROVIDER_ENV: &str = "AGENT_FLOW_PROVIDER";

impl ExecutorProvider {
    /// Resolves the provider: `AGENT_FLOW_PROVIDER` wins over the named
    /// config value, which wins over the default (`mock`). An `http://` or
    /// `https://` value selects the HTTP variant; anything else is treated
    /// as a program, with an optional `command:` prefix.
    pub fn from_settings(named: Option<&str>) -> Self {
        let value = std::env::var(PROVIDER_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| named.map(String::from));
        match value.as_deref() {
            None | Some("mock") => ExecutorProvider::Mock,
            Some(other) if other.starts_with("http://") || other.starts_with("https://") => {
                ExecutorProvider::Http {
                    endpoint: other.to_string(),
                }
            }
            Some(other) => {
                let program = other.strip_prefix("command:").unwrap_or(other);
                ExecutorProvider::Command {
                    program: program.to_string(),
                }
            }
        }
    }

    pub fn build(&self) -> Arc<dyn AgentExecutor> {
        match self {
            ExecutorProvider::Mock => Arc::new(MockExecutor::new()),
            ExecutorProvider::Command { program } => Arc::new(CommandExecutor::new(program.clone())),
            ExecutorProvider::Http { endpoint } => Arc::new(HttpExecutor::new(endpoint.clone())),
        }
    }
}

//! Mock collaborators for tests: closure-backed tool executor, echo agent
//! delegate, recording workflow runner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{AgentDelegate, CapabilityError, ToolExecutor, WorkflowRunner};

type ToolHandler = Arc<dyn Fn(Value) -> Result<Value, CapabilityError> + Send + Sync>;

/// Tool executor backed by per-name closures. Unregistered names fail
/// permanently.
#[derive(Clone, Default)]
pub struct MockToolExecutor {
    handlers: HashMap<String, ToolHandler>,
    /// Artificial latency per call, for timeout and concurrency tests.
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, CapabilityError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Convenience: a tool that always returns `value`.
    pub fn with_value(self, name: &str, value: Value) -> Self {
        self.with(name, move |_| Ok(value.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `(name, parameters)` pair this executor has served.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|(n, _)| n == name).count()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(
        &self,
        name: &str,
        parameters: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, CapabilityError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), parameters.clone()));
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CapabilityError::permanent("tool cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match self.handlers.get(name) {
            Some(handler) => handler(parameters),
            None => Err(CapabilityError::permanent(format!(
                "tool '{name}' is not registered"
            ))),
        }
    }
}

/// Agent delegate that replies `"{agent}: {payload}"` without recursion.
#[derive(Default)]
pub struct EchoAgentDelegate;

#[async_trait]
impl AgentDelegate for EchoAgentDelegate {
    async fn run(
        &self,
        agent: &str,
        payload: Value,
        _cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        Ok(format!("{agent}: {payload}"))
    }
}

/// Workflow runner that records started runs and reports instant completion.
#[derive(Default)]
pub struct RecordingWorkflowRunner {
    started: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingWorkflowRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<(String, Value)> {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WorkflowRunner for RecordingWorkflowRunner {
    async fn start(&self, name: &str, parameters: Value) -> Result<String, CapabilityError> {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.push((name.to_string(), parameters));
        Ok(format!("run-{}", started.len()))
    }

    async fn wait_terminal(
        &self,
        run_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Value, CapabilityError> {
        Ok(json!({ "run_id": run_id, "state": "succeeded" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tool_dispatches_by_name_and_records_calls() {
        let tools = MockToolExecutor::new()
            .with("double", |p| Ok(json!(p["n"].as_i64().unwrap_or(0) * 2)));
        let cancel = CancellationToken::new();
        let out = tools.execute("double", json!({"n": 21}), &cancel).await.unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(tools.call_count("double"), 1);
        assert!(tools.execute("missing", json!({}), &cancel).await.is_err());
    }

    #[tokio::test]
    async fn echo_agent_formats_reply() {
        let agent = EchoAgentDelegate;
        let cancel = CancellationToken::new();
        let reply = agent.run("helper", json!({"q": 1}), &cancel).await.unwrap();
        assert_eq!(reply, "helper: {\"q\":1}");
    }

    #[tokio::test]
    async fn recording_runner_tracks_starts() {
        let runner = RecordingWorkflowRunner::new();
        let id = runner.start("doc_update", json!({})).await.unwrap();
        assert_eq!(id, "run-1");
        assert_eq!(runner.started().len(), 1);
        let cancel = CancellationToken::new();
        let out = runner.wait_terminal(&id, &cancel).await.unwrap();
        assert_eq!(out["state"], "succeeded");
    }
}

//! Workflow adapter: fires executions via the workflow runner.
//!
//! Sync mode waits for the terminal state; async and fire_and_forget return
//! as soon as the run is accepted.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionKind, ActionMode};

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

/// Contract of the workflow runner (external collaborator).
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Starts an execution; returns the run id.
    async fn start(&self, name: &str, parameters: Value) -> Result<String, CapabilityError>;

    /// Waits for the run to reach a terminal state and returns its result.
    async fn wait_terminal(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, CapabilityError>;
}

pub struct WorkflowAdapter {
    runner: Arc<dyn WorkflowRunner>,
}

impl WorkflowAdapter {
    pub fn new(runner: Arc<dyn WorkflowRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CapabilityAdapter for WorkflowAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Workflow
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        let run_id = self.runner.start(req.name, req.parameters).await?;
        match req.mode {
            ActionMode::Sync => self.runner.wait_terminal(&run_id, req.cancel).await,
            ActionMode::Async | ActionMode::FireAndForget => Ok(json!({ "run_id": run_id })),
        }
    }
}

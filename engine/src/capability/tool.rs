//! Tool adapter: forwards to the external tool-execution subsystem.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action::ActionKind;

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

/// Contract of the tool-execution subsystem (external collaborator).
///
/// Implementations classify failures: transport/overload conditions are
/// transient (retryable), bad arguments are not.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        parameters: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, CapabilityError>;
}

pub struct ToolAdapter {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolAdapter {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CapabilityAdapter for ToolAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Tool
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        self.executor
            .execute(req.name, req.parameters, req.cancel)
            .await
    }
}

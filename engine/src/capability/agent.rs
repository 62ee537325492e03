//! Agent adapter: delegates to a nested agent session.
//!
//! The delegate seam may recursively drive this engine; each nested session
//! applies its own iteration cap.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action::ActionKind;

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

/// Runs a named agent to completion and returns its final response text.
#[async_trait]
pub trait AgentDelegate: Send + Sync {
    async fn run(
        &self,
        agent: &str,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError>;
}

pub struct AgentAdapter {
    delegate: Arc<dyn AgentDelegate>,
}

impl AgentAdapter {
    pub fn new(delegate: Arc<dyn AgentDelegate>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl CapabilityAdapter for AgentAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Agent
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        let text = self
            .delegate
            .run(req.name, req.parameters, req.cancel)
            .await?;
        Ok(Value::String(text))
    }
}

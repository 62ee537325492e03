//! Capability adapters: a uniform invocation surface over the six action
//! kinds. The engine dispatches; the capabilities themselves live behind
//! narrow external traits ([`ToolExecutor`], [`AgentDelegate`],
//! [`WorkflowRunner`]) supplied at engine construction.

mod agent;
mod internal;
mod llm;
pub mod mock;
mod relic;
mod tool;
mod workflow;

pub use agent::{AgentAdapter, AgentDelegate};
pub use internal::{InternalAdapter, InternalContext};
pub use llm::LlmAdapter;
pub use relic::{RelicAdapter, RelicRoutes};
pub use tool::{ToolAdapter, ToolExecutor};
pub use workflow::{WorkflowAdapter, WorkflowRunner};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionKind, ActionMode};

/// Failure reported by a capability. `transient` gates the dispatcher's retry.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
    pub transient: bool,
}

impl CapabilityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// One invocation handed to an adapter. Parameters are already `$ref`-resolved.
pub struct CapabilityRequest<'a> {
    pub name: &'a str,
    pub parameters: Value,
    /// Scheduling mode; the workflow adapter waits for terminal state only in sync mode.
    pub mode: ActionMode,
    pub cancel: &'a CancellationToken,
}

/// Uniform adapter interface. Implementations must observe the cancellation
/// token promptly; the dispatcher enforces the wall-clock deadline outside.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn kind(&self) -> ActionKind;

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError>;
}

/// Adapter lookup by action kind. Built once per session.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ActionKind, Arc<dyn CapabilityAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn CapabilityAdapter>) -> &mut Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn CapabilityAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter(ActionKind);

    #[async_trait]
    impl CapabilityAdapter for NullAdapter {
        fn kind(&self) -> ActionKind {
            self.0
        }

        async fn invoke(&self, _req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn registry_lookup_by_kind() {
        let mut reg = AdapterRegistry::new();
        reg.register(Arc::new(NullAdapter(ActionKind::Tool)));
        assert!(reg.get(ActionKind::Tool).is_some());
        assert!(reg.get(ActionKind::Relic).is_none());
    }

    #[test]
    fn capability_error_constructors_set_transient_flag() {
        assert!(CapabilityError::transient("x").transient);
        assert!(!CapabilityError::permanent("x").transient);
    }
}

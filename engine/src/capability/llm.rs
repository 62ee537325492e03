//! LLM adapter: delegates a sub-prompt to the backend and collects the full
//! completion. Scheduled like any tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::action::ActionKind;
use crate::llm::{ChatMessage, CompletionRequest, LlmBackend, SamplingParams};

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

#[derive(Deserialize)]
struct SubPrompt {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

pub struct LlmAdapter {
    backend: Arc<dyn LlmBackend>,
    defaults: SamplingParams,
}

impl LlmAdapter {
    pub fn new(backend: Arc<dyn LlmBackend>, defaults: SamplingParams) -> Self {
        Self { backend, defaults }
    }
}

#[async_trait]
impl CapabilityAdapter for LlmAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Llm
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        let sub: SubPrompt = serde_json::from_value(req.parameters)
            .map_err(|e| CapabilityError::permanent(format!("llm action parameters: {e}")))?;
        let mut sampling = self.defaults.clone();
        if let Some(model) = sub.model {
            sampling.model = model;
        }
        let request = CompletionRequest {
            system: sub.system.unwrap_or_default(),
            messages: vec![ChatMessage::user(sub.prompt)],
            sampling,
        };
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let backend = Arc::clone(&self.backend);
        let cancel = req.cancel.clone();
        let stream = tokio::spawn(async move { backend.stream(request, tx, &cancel).await });
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk);
        }
        match stream.await {
            Ok(Ok(_usage)) => Ok(Value::String(text)),
            Ok(Err(e)) => Err(CapabilityError::transient(format!("llm sub-call: {e}"))),
            Err(e) => Err(CapabilityError::permanent(format!("llm sub-call task: {e}"))),
        }
    }
}

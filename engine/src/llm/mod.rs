//! LLM backend abstraction: a streaming completion endpoint taking a system
//! prompt, a message list, and sampling parameters, yielding text chunks.
//!
//! Direct-HTTP ([`HttpBackend`]) and gateway-mediated ([`GatewayBackend`])
//! variants sit behind the one [`LlmBackend`] trait; [`MockBackend`] serves
//! tests with scripted, arbitrarily-chunked streams.

mod gateway;
mod http;
mod mock;

pub use gateway::GatewayBackend;
pub use http::HttpBackend;
pub use mock::MockBackend;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Message role in the completion request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Cognitive-model parameters for one completion.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SamplingParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One streaming completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
}

/// Token usage for one completion, when the backend reports it.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl LlmUsage {
    pub fn add(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Backend failures. All are session-fatal for the iteration that hit them;
/// the engine does not retry completions.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http: {0}")]
    Http(String),
    #[error("stream protocol: {0}")]
    Protocol(String),
    #[error("backend not configured: {0}")]
    NotConfigured(String),
    #[error("completion cancelled")]
    Cancelled,
}

/// Streaming completion endpoint.
///
/// Implementations send chunks through `chunks` as they arrive and return
/// optional usage once the stream ends. They must observe `cancel` promptly.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn stream(
        &self,
        request: CompletionRequest,
        chunks: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<LlmUsage>, BackendError>;
}

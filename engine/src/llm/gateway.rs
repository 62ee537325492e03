//! Gateway-mediated backend: the deployment's LLM gateway speaks a small
//! line-delimited JSON protocol (`chunk` / `usage` / `done` / `error` frames)
//! instead of raw provider SSE.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BackendError, CompletionRequest, LlmBackend, LlmUsage, Role};

pub struct GatewayBackend {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GatewayBackend {
    /// `url` is the gateway's completion endpoint, taken verbatim.
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(request: &CompletionRequest) -> Value {
        json!({
            "system": request.system,
            "messages": request.messages.iter().map(|m| json!({
                "role": match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": m.content,
            })).collect::<Vec<_>>(),
            "model": request.sampling.model,
            "temperature": request.sampling.temperature,
            "max_tokens": request.sampling.max_tokens,
            "stream": true,
        })
    }
}

enum GatewayFrame {
    Chunk(String),
    Usage(LlmUsage),
    Done,
    Error(String),
}

fn parse_frame(line: &str) -> Option<GatewayFrame> {
    let line = line.trim();
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    match value.get("type").and_then(Value::as_str)? {
        "chunk" => Some(GatewayFrame::Chunk(
            value.get("text").and_then(Value::as_str)?.to_string(),
        )),
        "usage" => Some(GatewayFrame::Usage(LlmUsage {
            prompt_tokens: value.get("prompt_tokens").and_then(Value::as_u64)? as u32,
            completion_tokens: value.get("completion_tokens").and_then(Value::as_u64)? as u32,
            total_tokens: value.get("total_tokens").and_then(Value::as_u64)? as u32,
        })),
        "done" => Some(GatewayFrame::Done),
        "error" => Some(GatewayFrame::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("gateway error")
                .to_string(),
        )),
        _ => None,
    }
}

#[async_trait]
impl LlmBackend for GatewayBackend {
    async fn stream(
        &self,
        request: CompletionRequest,
        chunks: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<LlmUsage>, BackendError> {
        let mut req = self.client.post(&self.url).json(&Self::request_body(&request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            r = req.send() => r.map_err(|e| BackendError::Http(e.to_string()))?,
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http(format!("{status}: {body}")));
        }

        let mut usage = None;
        let mut buf = String::new();
        let mut bytes = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                n = bytes.next() => n,
            };
            let Some(piece) = next else { break };
            let piece = piece.map_err(|e| BackendError::Http(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&piece));
            while let Some(nl) = buf.find('\n') {
                let line: String = buf.drain(..=nl).collect();
                match parse_frame(&line) {
                    Some(GatewayFrame::Chunk(text)) => {
                        if chunks.send(text).await.is_err() {
                            return Ok(usage);
                        }
                    }
                    Some(GatewayFrame::Usage(u)) => usage = Some(u),
                    Some(GatewayFrame::Done) => return Ok(usage),
                    Some(GatewayFrame::Error(msg)) => {
                        return Err(BackendError::Protocol(msg));
                    }
                    None => {}
                }
            }
        }
        Ok(usage)
    }
}

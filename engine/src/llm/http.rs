//! Direct-HTTP backend: OpenAI-style `/v1/chat/completions` with SSE streaming.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BackendError, ChatMessage, CompletionRequest, LlmBackend, LlmUsage, Role};

pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn request_body(request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(ChatMessage::system(request.system.clone()));
        }
        messages.extend(request.messages.iter().cloned());
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();
        let mut body = json!({
            "model": request.sampling.model,
            "messages": wire,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = request.sampling.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.sampling.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

/// Extracts the delta content and usage from one SSE `data:` payload.
fn parse_data_line(line: &str) -> Option<(Option<String>, Option<LlmUsage>)> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    let content = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = value.get("usage").and_then(|u| {
        Some(LlmUsage {
            prompt_tokens: u.get("prompt_tokens")?.as_u64()? as u32,
            completion_tokens: u.get("completion_tokens")?.as_u64()? as u32,
            total_tokens: u.get("total_tokens")?.as_u64()? as u32,
        })
    });
    Some((content, usage))
}

#[async_trait]
impl LlmBackend for HttpBackend {
    async fn stream(
        &self,
        request: CompletionRequest,
        chunks: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<LlmUsage>, BackendError> {
        let mut req = self
            .client
            .post(self.completions_url())
            .json(&Self::request_body(&request));
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
                let line = line.trim_end();
                if let Some((content, line_usage)) = parse_data_line(line) {
                    if let Some(u) = line_usage {
                        usage = Some(u);
                    }
                    if let Some(text) = content {
                        if !text.is_empty() && chunks.send(text).await.is_err() {
                            // Consumer side shut down; stop reading.
                            return Ok(usage);
                        }
                    }
                }
            }
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data_line_extracts_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#;
        let (content, usage) = parse_data_line(line).unwrap();
        assert_eq!(content.as_deref(), Some("hi"));
        assert!(usage.is_none());
    }

    #[test]
    fn parse_data_line_extracts_usage() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#;
        let (content, usage) = parse_data_line(line).unwrap();
        assert!(content.is_none());
        assert_eq!(usage.unwrap().total_tokens, 10);
    }

    #[test]
    fn parse_data_line_skips_done_and_noise() {
        assert!(parse_data_line("data: [DONE]").is_none());
        assert!(parse_data_line(": keepalive").is_none());
        assert!(parse_data_line("").is_none());
    }

    #[test]
    fn request_body_includes_system_and_sampling() {
        let body = HttpBackend::request_body(&CompletionRequest {
            system: "persona".into(),
            messages: vec![ChatMessage::user("hi")],
            sampling: super::super::SamplingParams {
                model: "m-1".into(),
                temperature: Some(0.2),
                max_tokens: Some(512),
            },
        });
        assert_eq!(body["model"], "m-1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn completions_url_joins_cleanly() {
        let b = HttpBackend::new("http://localhost:4000/", None);
        assert_eq!(
            b.completions_url(),
            "http://localhost:4000/v1/chat/completions"
        );
    }
}

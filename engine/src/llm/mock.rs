//! Scripted backend for tests: each call pops the next scripted stream and
//! sends its chunks verbatim.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BackendError, CompletionRequest, LlmBackend, LlmUsage};

/// Deterministic [`LlmBackend`]: streams pre-scripted chunk sequences, one
/// script per call, repeating the last script when exhausted.
pub struct MockBackend {
    scripts: Mutex<VecDeque<Vec<String>>>,
    last: Mutex<Option<Vec<String>>>,
    usage: Option<LlmUsage>,
    /// Requests seen, for prompt assertions.
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    /// One scripted stream, already split into chunks.
    pub fn with_stream(chunks: Vec<&str>) -> Self {
        Self::with_streams(vec![chunks])
    }

    /// Several scripted streams, consumed in order (one per iteration).
    pub fn with_streams(streams: Vec<Vec<&str>>) -> Self {
        Self {
            scripts: Mutex::new(
                streams
                    .into_iter()
                    .map(|s| s.into_iter().map(str::to_string).collect())
                    .collect(),
            ),
            last: Mutex::new(None),
            usage: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Splits `text` into `size`-char chunks; exercises boundary handling.
    pub fn chunked(text: &str, size: usize) -> Vec<String> {
        let size = size.max(1);
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(size)
            .map(|c| c.iter().collect::<String>())
            .collect()
    }

    /// Like [`MockBackend::with_stream`], but re-chunked to `size` characters.
    pub fn with_chunked_stream(text: &str, size: usize) -> Self {
        let chunks = Self::chunked(text, size);
        Self {
            scripts: Mutex::new(VecDeque::from([chunks])),
            last: Mutex::new(None),
            usage: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_usage(mut self, usage: LlmUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// All requests this backend has served, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn stream(
        &self,
        request: CompletionRequest,
        chunks: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<LlmUsage>, BackendError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let script = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            match scripts.pop_front() {
                Some(s) => {
                    let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
                    *last = Some(s.clone());
                    s
                }
                None => self
                    .last
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_default(),
            }
        };
        for chunk in script {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            if chunks.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(self.usage.clone())
    }
}

//! Event emitter: one totally ordered frame stream per session.
//!
//! All components emit through this type, which assigns contiguous `seq`
//! numbers under one lock and pushes into a bounded channel (the consumer's
//! backpressure propagates to the LLM read loop). Response chunks that
//! reference unresolved `$vars` are held in a FIFO and flushed in order as the
//! variable store reports outcomes; the buffer lock is held across the flush
//! so later chunks cannot overtake one being flushed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use stream_event::{EventFrame, FrameSeq, SegmentEvent};
use tokio::sync::{mpsc, Mutex};

use crate::error::{SoftError, SoftErrorCode};
use crate::vars::{scan_refs, VarOutcome, VariableStore};

/// Soft errors queued for the next iteration's prompt. Shared between the
/// emitter (which records them as they happen) and the iteration controller
/// (which drains them at prompt build).
#[derive(Default)]
pub struct SoftQueue {
    inner: StdMutex<Vec<SoftError>>,
}

impl SoftQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, err: SoftError) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push(err);
    }

    pub fn drain(&self) -> Vec<SoftError> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Resolution state of one `$ref` seen in response content.
#[derive(Clone, Debug)]
enum RefState {
    Ready(Value),
    Failed(String),
    /// No declared producer: the token stays literal (soft error already sent).
    Literal,
}

struct PendingChunk {
    text: String,
    last: bool,
    waiting: HashSet<String>,
}

#[derive(Default)]
struct ResponseBuffer {
    queue: VecDeque<PendingChunk>,
    refs: HashMap<String, RefState>,
    watched: HashSet<String>,
}

struct EmitInner {
    seq: FrameSeq,
    tx: mpsc::Sender<EventFrame>,
    dropped: u64,
    closed: bool,
}

pub struct EventEmitter {
    inner: Mutex<EmitInner>,
    response: Mutex<ResponseBuffer>,
    vars: Arc<VariableStore>,
    soft: Arc<SoftQueue>,
}

impl EventEmitter {
    /// Creates the emitter and the consumer's end of the frame stream.
    pub fn new(
        session_id: &str,
        capacity: usize,
        vars: Arc<VariableStore>,
        soft: Arc<SoftQueue>,
    ) -> (Arc<Self>, mpsc::Receiver<EventFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Arc::new(Self {
            inner: Mutex::new(EmitInner {
                seq: FrameSeq::new(session_id),
                tx,
                dropped: 0,
                closed: false,
            }),
            response: Mutex::new(ResponseBuffer::default()),
            vars,
            soft,
        });
        (emitter, rx)
    }

    /// Emits one frame. Never fails: after the consumer disconnects, frames
    /// are counted as dropped and the session continues per policy.
    pub async fn emit(&self, event: SegmentEvent) {
        let mut inner = self.inner.lock().await;
        let frame = inner.seq.frame(event);
        if inner.closed {
            inner.dropped += 1;
            return;
        }
        if inner.tx.send(frame).await.is_err() {
            inner.closed = true;
            inner.dropped += 1;
            tracing::warn!("event stream consumer disconnected; counting drops");
        }
    }

    /// Emits a soft-error frame and queues it for the next prompt.
    pub async fn report_soft(&self, err: SoftError) {
        self.soft.push(err.clone());
        self.emit(SegmentEvent::SoftError {
            code: err.code.as_str().to_string(),
            message: err.message,
        })
        .await;
    }

    /// Frames dropped after consumer disconnect.
    pub async fn dropped(&self) -> u64 {
        self.inner.lock().await.dropped
    }

    /// Streams one response chunk. Chunks whose `$refs` all resolve (and with
    /// an empty buffer ahead of them) emit immediately; otherwise they join
    /// the FIFO and flush in order as producers complete. `declared` answers
    /// whether a tracked action in this iteration produces the key.
    pub async fn stream_response(
        self: &Arc<Self>,
        text: &str,
        last: bool,
        declared: &(dyn Fn(&str) -> bool + Send + Sync),
    ) {
        let mut buf = self.response.lock().await;
        let mut waiting = HashSet::new();
        let mut to_watch = Vec::new();
        for key in scan_refs(text) {
            if buf.refs.contains_key(&key) {
                continue; // outcome already known this iteration
            }
            if let Some(value) = self.vars.get(&key) {
                buf.refs.insert(key, RefState::Ready(value));
            } else if declared(&key) {
                waiting.insert(key.clone());
                if buf.watched.insert(key.clone()) {
                    to_watch.push(key);
                }
            } else {
                self.report_soft(SoftError::new(
                    SoftErrorCode::UnresolvedVariable,
                    format!("response references ${key}, which no action produces"),
                ))
                .await;
                buf.refs.insert(key, RefState::Literal);
            }
        }
        for key in to_watch {
            self.watch_key(key);
        }
        if buf.queue.is_empty() && waiting.is_empty() {
            self.render_and_emit(&buf, text, last).await;
        } else {
            buf.queue.push_back(PendingChunk {
                text: text.to_string(),
                last,
                waiting,
            });
        }
    }

    fn watch_key(self: &Arc<Self>, key: String) {
        let rx = self.vars.subscribe(&key);
        let emitter = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match rx.await {
                Ok(outcome) => outcome,
                // Producer side torn down (iteration reset); nothing to flush.
                Err(_) => return,
            };
            emitter.resolve_key(&key, outcome).await;
        });
    }

    /// Records a variable outcome and flushes the FIFO head while resolvable.
    async fn resolve_key(self: &Arc<Self>, key: &str, outcome: VarOutcome) {
        let mut buf = self.response.lock().await;
        let state = match outcome {
            VarOutcome::Ready(v) => RefState::Ready(v),
            VarOutcome::Failed(e) => RefState::Failed(e),
        };
        buf.refs.insert(key.to_string(), state);
        loop {
            let ready = match buf.queue.front() {
                Some(head) => head.waiting.iter().all(|k| buf.refs.contains_key(k)),
                None => false,
            };
            if !ready {
                break;
            }
            let Some(chunk) = buf.queue.pop_front() else {
                break;
            };
            self.render_and_emit(&buf, &chunk.text, chunk.last).await;
        }
    }

    /// Flushes everything still buffered (iteration teardown). Chunks with
    /// refs that never resolved keep their tokens literal with a soft error.
    pub async fn drain_response(self: &Arc<Self>) {
        let mut buf = self.response.lock().await;
        while let Some(chunk) = buf.queue.pop_front() {
            for key in chunk.waiting.iter() {
                if !buf.refs.contains_key(key) {
                    self.report_soft(SoftError::new(
                        SoftErrorCode::UnresolvedVariable,
                        format!("${key} never resolved before iteration end"),
                    ))
                    .await;
                    buf.refs.insert(key.clone(), RefState::Literal);
                }
            }
            self.render_and_emit(&buf, &chunk.text, chunk.last).await;
        }
        buf.refs.clear();
        buf.watched.clear();
    }

    /// Substitutes known refs into one chunk and emits it. Failed producers
    /// leave a visible placeholder and a matching soft error.
    async fn render_and_emit(&self, buf: &ResponseBuffer, text: &str, last: bool) {
        let failed: std::cell::RefCell<Vec<(String, String)>> = std::cell::RefCell::new(Vec::new());
        let content = crate::vars::substitute_text(
            text,
            &|name| match buf.refs.get(name) {
                Some(RefState::Ready(v)) => Some(v.clone()),
                Some(RefState::Failed(err)) => {
                    failed.borrow_mut().push((name.to_string(), err.clone()));
                    Some(Value::String(format!("[error: {name} unavailable]")))
                }
                Some(RefState::Literal) | None => None,
            },
            &mut crate::vars::Substitution::default(),
        );
        for (name, err) in failed.into_inner() {
            self.report_soft(SoftError::new(
                SoftErrorCode::UnresolvedVariable,
                format!("${name} unavailable: {err}"),
            ))
            .await;
        }
        self.emit(SegmentEvent::ResponseChunk { content, last }).await;
    }
}

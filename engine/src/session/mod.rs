//! Session lifecycle and the iteration controller.
//!
//! [`Engine::start_session`] wires every component for one conversation and
//! spawns the run loop: build the prompt, stream the LLM through the parser,
//! dispatch parsed actions, wait the completion barrier, then iterate while
//! the stream ended without a `final="true"` response, bounded by the
//! iteration cap. Errors reach the consumer only as event frames.

mod prompt;

pub use prompt::{build_system_prompt, PROTOCOL_GUIDE};

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use stream_event::{EventFrame, SegmentEvent, UsageSummary};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionDescriptor, ActionKind, ActionMode, ActionOrigin, OnErrorPolicy};
use crate::capability::{
    AdapterRegistry, AgentAdapter, AgentDelegate, InternalAdapter, InternalContext, LlmAdapter,
    RelicAdapter, RelicRoutes, ToolAdapter, ToolExecutor, WorkflowAdapter, WorkflowRunner,
};
use crate::dag::DagError;
use crate::dispatch::{DeclaredCapabilities, Dispatcher, IterationScheduler};
use crate::emitter::{EventEmitter, SoftQueue};
use crate::error::{EngineError, SoftError, SoftErrorCode};
use crate::feeds::{FeedConfig, FeedManager};
use crate::llm::{ChatMessage, CompletionRequest, LlmBackend, SamplingParams};
use crate::metadata::{MetadataEngine, MetadataField, WorkflowTrigger};
use crate::protocol::{ParsedEvent, StreamParser};
use crate::settings::EngineSettings;
use crate::vars::VariableStore;

/// Read-only snapshot of one agent's configuration. The engine consumes this
/// as an already-parsed struct; manifest loading lives elsewhere.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    pub persona: String,
    pub cognition: SamplingParams,
    pub iteration_cap: u32,
    /// Declared capability names per kind; empty lists mean unrestricted.
    pub tools: Vec<String>,
    pub agents: Vec<String>,
    pub relics: Vec<String>,
    pub workflows: Vec<String>,
    pub feeds: Vec<FeedConfig>,
    pub metadata_schema: Vec<MetadataField>,
    pub triggers: Vec<WorkflowTrigger>,
    /// Allowlist for `internal` actions.
    pub internal_ops: Vec<String>,
    pub max_parallel_actions: Option<usize>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persona: persona.into(),
            cognition: SamplingParams::default(),
            iteration_cap: 5,
            tools: Vec::new(),
            agents: Vec::new(),
            relics: Vec::new(),
            workflows: Vec::new(),
            feeds: Vec::new(),
            metadata_schema: Vec::new(),
            triggers: Vec::new(),
            internal_ops: Vec::new(),
            max_parallel_actions: None,
        }
    }
}

/// External collaborators the engine dispatches against.
pub struct CapabilitySeams {
    pub tools: Arc<dyn ToolExecutor>,
    pub agents: Arc<dyn AgentDelegate>,
    pub workflows: Arc<dyn WorkflowRunner>,
    pub relics: RelicRoutes,
}

/// Terminal summary of one session.
#[derive(Clone, Debug, Default)]
pub struct SessionOutcome {
    /// Why the session ended ("completed", "iteration_cap_exceeded",
    /// "cancelled", or an error description).
    pub reason: String,
    pub final_response: String,
    pub iterations: u32,
    pub dropped_events: u64,
    pub usage: UsageSummary,
}

/// Live handle to a running session: the ordered event stream plus control.
pub struct SessionHandle {
    pub session_id: String,
    events: mpsc::Receiver<EventFrame>,
    cancel: CancellationToken,
    outcome: tokio::task::JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub async fn next_event(&mut self) -> Option<EventFrame> {
        self.events.recv().await
    }

    /// The raw event stream (SSE-ready via [`EventFrame::to_sse`]).
    pub fn into_stream(self) -> (ReceiverStream<EventFrame>, SessionControl) {
        (
            ReceiverStream::new(self.events),
            SessionControl {
                session_id: self.session_id,
                cancel: self.cancel,
                outcome: self.outcome,
            },
        )
    }

    /// Requests session termination; in-flight actions receive cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the run loop. Events left unread are discarded.
    pub async fn join(self) -> SessionOutcome {
        drop(self.events);
        self.outcome.await.unwrap_or_else(|e| SessionOutcome {
            reason: format!("session task panicked: {e}"),
            ..SessionOutcome::default()
        })
    }
}

/// Control half of a split [`SessionHandle`].
pub struct SessionControl {
    pub session_id: String,
    cancel: CancellationToken,
    outcome: tokio::task::JoinHandle<SessionOutcome>,
}

impl SessionControl {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> SessionOutcome {
        self.outcome.await.unwrap_or_else(|e| SessionOutcome {
            reason: format!("session task panicked: {e}"),
            ..SessionOutcome::default()
        })
    }
}

/// The engine: backend + capability seams + settings, ready to start sessions.
pub struct Engine {
    backend: Arc<dyn LlmBackend>,
    seams: CapabilitySeams,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(backend: Arc<dyn LlmBackend>, seams: CapabilitySeams, settings: EngineSettings) -> Self {
        Self {
            backend,
            seams,
            settings,
        }
    }

    /// Creates every per-session store, wires the adapters, and spawns the
    /// run loop. Returns immediately with the consumer handle.
    pub fn start_session(
        &self,
        config: AgentConfig,
        user_message: impl Into<String>,
    ) -> SessionHandle {
        let session_id = format!("sess-{}", uuid::Uuid::new_v4().simple());
        let cancel = CancellationToken::new();
        let vars = Arc::new(VariableStore::new());
        let soft = Arc::new(SoftQueue::new());
        let (emitter, events) = EventEmitter::new(
            &session_id,
            self.settings.event_queue_capacity,
            Arc::clone(&vars),
            Arc::clone(&soft),
        );
        let feeds = FeedManager::new(
            Arc::clone(&emitter),
            cancel.child_token(),
            self.settings.periodic_feeds_enabled,
        );
        let history: Arc<StdMutex<Vec<ChatMessage>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(ToolAdapter::new(Arc::clone(&self.seams.tools))))
            .register(Arc::new(AgentAdapter::new(Arc::clone(&self.seams.agents))))
            .register(Arc::new(RelicAdapter::new(self.seams.relics.clone())))
            .register(Arc::new(WorkflowAdapter::new(Arc::clone(
                &self.seams.workflows,
            ))))
            .register(Arc::new(LlmAdapter::new(
                Arc::clone(&self.backend),
                config.cognition.clone(),
            )))
            .register(Arc::new(InternalAdapter::new(
                InternalContext {
                    feeds: Arc::clone(&feeds),
                    vars: Arc::clone(&vars),
                    history: Arc::clone(&history),
                },
                config.internal_ops.iter().cloned(),
            )));
        let registry = Arc::new(registry);
        feeds.set_adapters(Arc::clone(&registry));

        let mut declared = DeclaredCapabilities::new();
        declared.declare(ActionKind::Tool, &config.tools);
        declared.declare(ActionKind::Agent, &config.agents);
        declared.declare(ActionKind::Relic, &config.relics);
        declared.declare(ActionKind::Workflow, &config.workflows);

        let dispatcher = Dispatcher::new(
            registry,
            Arc::clone(&vars),
            Arc::clone(&emitter),
            declared,
            cancel.clone(),
            config
                .max_parallel_actions
                .unwrap_or(self.settings.max_parallel_actions),
            Some(self.settings.default_action_timeout),
        );
        let metadata = Arc::new(MetadataEngine::new(
            config.metadata_schema.clone(),
            config.triggers.clone(),
        ));

        let run = SessionRun {
            config,
            backend: Arc::clone(&self.backend),
            emitter,
            vars,
            soft,
            feeds,
            metadata,
            dispatcher,
            history,
            cancel: cancel.clone(),
            settings: self.settings.clone(),
        };
        let outcome = tokio::spawn(run.run(user_message.into()));
        SessionHandle {
            session_id,
            events,
            cancel,
            outcome,
        }
    }
}

/// Everything one running session owns.
struct SessionRun {
    config: AgentConfig,
    backend: Arc<dyn LlmBackend>,
    emitter: Arc<EventEmitter>,
    vars: Arc<VariableStore>,
    soft: Arc<SoftQueue>,
    feeds: Arc<FeedManager>,
    metadata: Arc<MetadataEngine>,
    dispatcher: Arc<Dispatcher>,
    history: Arc<StdMutex<Vec<ChatMessage>>>,
    cancel: CancellationToken,
    settings: EngineSettings,
}

/// Per-iteration verdict of the read loop.
enum IterationEnd {
    StreamEnded,
    Fatal(String),
}

impl SessionRun {
    async fn run(self, user_message: String) -> SessionOutcome {
        for feed in self.config.feeds.clone() {
            if let Err(e) = self.feeds.add(feed).await {
                tracing::warn!("declared feed skipped: {e}");
            }
        }
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ChatMessage::user(user_message));

        let cap = self
            .settings
            .iteration_cap_override
            .unwrap_or(self.config.iteration_cap)
            .max(1);
        let mut usage = UsageSummary::default();
        let mut iterations = 0u32;
        let mut final_response = String::new();
        let mut reason = String::from("completed");

        for iteration in 1..=cap {
            if self.cancel.is_cancelled() {
                reason = "cancelled".into();
                break;
            }
            iterations = iteration;
            self.emitter
                .emit(SegmentEvent::IterationBoundary { iteration })
                .await;
            self.vars.begin_iteration();

            // Feed snapshot is frozen here; dynamic mutations land next round.
            let (snapshot, feed_softs) = self.feeds.snapshot().await;
            for err in feed_softs {
                self.emitter.report_soft(err).await;
            }
            for (id, value) in &snapshot {
                self.emitter
                    .emit(SegmentEvent::ContextFeedUpdate {
                        id: id.clone(),
                        value: value.clone(),
                    })
                    .await;
            }

            let corrections = self.soft.drain();
            let system = build_system_prompt(
                &self.config.persona,
                &snapshot,
                self.metadata.summary(),
                &corrections,
            );
            let messages = self
                .history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            let scheduler = IterationScheduler::new(Arc::clone(&self.dispatcher), &self.cancel);
            let backend_cancel = self.cancel.child_token();
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
            let backend = Arc::clone(&self.backend);
            let request = CompletionRequest {
                system,
                messages,
                sampling: self.config.cognition.clone(),
            };
            let stream_cancel = backend_cancel.clone();
            let backend_task =
                tokio::spawn(
                    async move { backend.stream(request, chunk_tx, &stream_cancel).await },
                );

            let mut parser = StreamParser::new();
            let mut raw = String::new();
            let mut last_response = String::new();
            let mut end = IterationEnd::StreamEnded;
            'read: while let Some(chunk) = chunk_rx.recv().await {
                raw.push_str(&chunk);
                for event in parser.feed(&chunk) {
                    if let Err(fatal) = self
                        .handle_event(event, &scheduler, &mut last_response)
                        .await
                    {
                        end = IterationEnd::Fatal(fatal);
                        break 'read;
                    }
                }
            }
            if matches!(end, IterationEnd::StreamEnded) {
                for event in parser.finish() {
                    if let Err(fatal) = self
                        .handle_event(event, &scheduler, &mut last_response)
                        .await
                    {
                        end = IterationEnd::Fatal(fatal);
                        break;
                    }
                }
            }
            backend_cancel.cancel();
            drop(chunk_rx);

            let mut backend_fatal: Option<EngineError> = None;
            match backend_task.await {
                Ok(Ok(Some(u))) => {
                    usage.prompt_tokens += u.prompt_tokens;
                    usage.completion_tokens += u.completion_tokens;
                    usage.total_tokens += u.total_tokens;
                }
                Ok(Ok(None)) => {}
                Ok(Err(crate::llm::BackendError::Cancelled)) => {}
                Ok(Err(e)) => backend_fatal = Some(EngineError::from(e)),
                Err(e) => {
                    backend_fatal =
                        Some(EngineError::Invariant(format!("backend task failed: {e}")))
                }
            }

            // Barrier: every tracked action reaches a terminal state before
            // the iteration decision.
            scheduler.drain().await;
            self.emitter.drain_response().await;

            if !raw.is_empty() {
                self.history
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(ChatMessage::assistant(raw));
            }
            if !last_response.is_empty() {
                final_response = last_response.clone();
            }

            if let Some(fatal) = backend_fatal {
                reason = fatal.to_string();
                self.emitter
                    .report_soft(SoftError::new(SoftErrorCode::IterationFatal, reason.clone()))
                    .await;
                break;
            }
            if let IterationEnd::Fatal(fatal) = end {
                self.emitter
                    .report_soft(SoftError::new(SoftErrorCode::IterationFatal, fatal))
                    .await;
                // The iteration is over; the final flag still decides whether
                // the session continues.
            }
            if self.cancel.is_cancelled() {
                reason = "cancelled".into();
                break;
            }
            if parser.final_response_seen() {
                reason = "completed".into();
                break;
            }
            if iteration == cap {
                reason = "iteration_cap_exceeded".into();
                self.emitter
                    .report_soft(SoftError::new(
                        SoftErrorCode::IterationCapExceeded,
                        format!("iteration cap of {cap} reached; forcing a final response"),
                    ))
                    .await;
                let synthesized = if last_response.is_empty() {
                    format!("[no final response after {cap} iterations]")
                } else {
                    last_response
                };
                self.emitter
                    .emit(SegmentEvent::ResponseChunk {
                        content: synthesized.clone(),
                        last: true,
                    })
                    .await;
                final_response = synthesized;
            }
        }

        // Teardown: give detached work its grace window, stop feed refreshers,
        // then cancel anything left and emit the terminal frame.
        self.dispatcher
            .shutdown_detached(self.settings.shutdown_grace)
            .await;
        self.feeds.shutdown().await;
        self.cancel.cancel();
        self.emitter
            .emit(SegmentEvent::SessionEnd {
                reason: reason.clone(),
                usage: Some(usage.clone()),
            })
            .await;
        SessionOutcome {
            reason,
            final_response,
            iterations,
            dropped_events: self.emitter.dropped().await,
            usage,
        }
    }

    /// Routes one parser event. `Err` is an iteration-fatal reason.
    async fn handle_event(
        &self,
        event: ParsedEvent,
        scheduler: &Arc<IterationScheduler>,
        last_response: &mut String,
    ) -> Result<(), String> {
        match event {
            ParsedEvent::Thought { text } => {
                self.emitter
                    .emit(SegmentEvent::ThoughtChunk { content: text })
                    .await;
            }
            ParsedEvent::ResponseStart { .. } => {
                last_response.clear();
            }
            ParsedEvent::Response { text, last } => {
                last_response.push_str(&text);
                let sched = Arc::clone(scheduler);
                let declared = move |key: &str| sched.produces_key(key);
                self.emitter.stream_response(&text, last, &declared).await;
            }
            ParsedEvent::Action(desc) => match scheduler.submit(desc).await {
                Ok(()) => {}
                Err(DagError::DuplicateId(id)) => {
                    self.emitter
                        .report_soft(SoftError::new(
                            SoftErrorCode::DuplicateActionId,
                            format!("action id '{id}' already used in this iteration; skipped"),
                        ))
                        .await;
                }
                Err(cycle @ DagError::Cycle { .. }) => {
                    return Err(cycle.to_string());
                }
            },
            ParsedEvent::FeedOverride { id, body } => {
                self.feeds.override_value(&id, body).await;
            }
            ParsedEvent::Metadata(payload) => {
                let outcome = self.metadata.apply(&payload);
                if !outcome.applied.is_empty() {
                    self.emitter
                        .emit(SegmentEvent::MetadataUpdate {
                            fields: serde_json::Value::Object(outcome.applied),
                        })
                        .await;
                }
                for err in outcome.soft_errors {
                    self.emitter.report_soft(err).await;
                }
                for trigger in outcome.fired {
                    let desc = ActionDescriptor {
                        id: format!(
                            "wf-{}-{}",
                            trigger.workflow,
                            uuid::Uuid::new_v4().simple()
                        ),
                        kind: ActionKind::Workflow,
                        mode: ActionMode::FireAndForget,
                        name: trigger.workflow.clone(),
                        parameters: json!({
                            "agent": self.config.name,
                            "metadata": self.metadata.state(),
                        }),
                        output_key: None,
                        depends_on: Vec::new(),
                        timeout: None,
                        retry: 0,
                        on_error: OnErrorPolicy::Cancel,
                        origin: ActionOrigin::TopLevel,
                        index: 0,
                    };
                    // Detached submit never fails.
                    let _ = scheduler.submit(desc).await;
                }
            }
            ParsedEvent::Soft(err) => {
                self.emitter.report_soft(err).await;
            }
        }
        Ok(())
    }
}

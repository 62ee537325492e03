//! Cortex streaming execution engine.
//!
//! Drives an autonomous agent loop against a streaming LLM backend: an
//! incremental tag parser turns the token stream into thought/response
//! content, action descriptors, context-feed overrides and metadata updates;
//! a DAG scheduler dispatches actions under concurrency, timeout and retry
//! constraints; action outputs substitute into later parameters and response
//! text; and everything multiplexes into one ordered frame stream for the
//! consumer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cortex_engine::{
//!     AgentConfig, CapabilitySeams, Engine, EngineSettings, MockBackend,
//!     mock::{EchoAgentDelegate, MockToolExecutor, RecordingWorkflowRunner},
//!     RelicRoutes,
//! };
//!
//! # async fn demo() {
//! let backend = Arc::new(MockBackend::with_stream(vec![
//!     "<response final=\"true\">hello</response>",
//! ]));
//! let engine = Engine::new(
//!     backend,
//!     CapabilitySeams {
//!         tools: Arc::new(MockToolExecutor::new()),
//!         agents: Arc::new(EchoAgentDelegate),
//!         workflows: Arc::new(RecordingWorkflowRunner::new()),
//!         relics: RelicRoutes::new(),
//!     },
//!     EngineSettings::default(),
//! );
//! let mut session = engine.start_session(AgentConfig::new("demo", "You help."), "hi");
//! while let Some(frame) = session.next_event().await {
//!     println!("{}", frame.to_sse().unwrap_or_default());
//! }
//! # }
//! ```

pub mod action;
pub mod capability;
pub mod dag;
pub mod dispatch;
pub mod emitter;
pub mod error;
pub mod feeds;
pub mod llm;
pub mod metadata;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod vars;

pub use action::{
    ActionDescriptor, ActionKind, ActionMode, ActionOrigin, ActionResult, ActionStatus,
    OnErrorPolicy,
};
pub use capability::{
    mock, AdapterRegistry, AgentDelegate, CapabilityAdapter, CapabilityError, CapabilityRequest,
    RelicRoutes, ToolExecutor, WorkflowRunner,
};
pub use dispatch::{DeclaredCapabilities, Dispatcher, IterationScheduler};
pub use emitter::{EventEmitter, SoftQueue};
pub use error::{EngineError, SoftError, SoftErrorCode};
pub use feeds::{FeedConfig, FeedKind, FeedManager, FeedPatch, FeedSource, InternalSource};
pub use llm::{
    BackendError, ChatMessage, CompletionRequest, GatewayBackend, HttpBackend, LlmBackend,
    LlmUsage, MockBackend, Role, SamplingParams,
};
pub use metadata::{
    FieldKind, MatchMode, MetadataEngine, MetadataField, TriggerCondition, WorkflowTrigger,
};
pub use protocol::{ParsedEvent, StreamParser};
pub use session::{
    AgentConfig, CapabilitySeams, Engine, SessionControl, SessionHandle, SessionOutcome,
    PROTOCOL_GUIDE,
};
pub use settings::EngineSettings;
pub use vars::{VarOutcome, VariableStore};

// Re-exported so consumers match on frames without a separate dependency.
pub use stream_event::{EventFrame, SegmentEvent, UsageSummary};

// Re-exported for implementors of [`LlmBackend`] and the capability seams,
// which all receive this token type.
pub use tokio_util::sync::CancellationToken;

//! Shared rig for engine end-to-end tests: scripted backend, mock seams,
//! full-session event collection.
#![allow(dead_code)] // each test binary uses a different subset of helpers

use std::sync::Arc;

use cortex_engine::mock::{EchoAgentDelegate, MockToolExecutor, RecordingWorkflowRunner};
use cortex_engine::{
    AgentConfig, CapabilitySeams, Engine, EngineSettings, EventFrame, MockBackend, RelicRoutes,
    SegmentEvent, SessionOutcome,
};

pub struct Rig {
    pub backend: Arc<MockBackend>,
    pub tools: MockToolExecutor,
    pub workflows: Arc<RecordingWorkflowRunner>,
    pub settings: EngineSettings,
}

impl Rig {
    pub fn new(backend: MockBackend, tools: MockToolExecutor) -> Self {
        Self {
            backend: Arc::new(backend),
            tools,
            workflows: Arc::new(RecordingWorkflowRunner::new()),
            settings: EngineSettings {
                shutdown_grace: std::time::Duration::from_secs(1),
                ..EngineSettings::default()
            },
        }
    }

    /// Runs one session to completion, draining the event stream as it goes.
    pub async fn run(&self, config: AgentConfig, message: &str) -> (Vec<EventFrame>, SessionOutcome) {
        let engine = Engine::new(
            Arc::clone(&self.backend) as Arc<dyn cortex_engine::LlmBackend>,
            CapabilitySeams {
                tools: Arc::new(self.tools.clone()),
                agents: Arc::new(EchoAgentDelegate),
                workflows: Arc::clone(&self.workflows) as Arc<dyn cortex_engine::WorkflowRunner>,
                relics: RelicRoutes::new(),
            },
            self.settings.clone(),
        );
        let mut handle = engine.start_session(config, message);
        let mut frames = Vec::new();
        while let Some(frame) = handle.next_event().await {
            frames.push(frame);
        }
        let outcome = handle.join().await;
        (frames, outcome)
    }
}

pub fn response_text(frames: &[EventFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match &f.event {
            SegmentEvent::ResponseChunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

pub fn thought_text(frames: &[EventFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match &f.event {
            SegmentEvent::ThoughtChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

pub fn soft_codes(frames: &[EventFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match &f.event {
            SegmentEvent::SoftError { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

pub fn completions(frames: &[EventFrame]) -> Vec<(String, String)> {
    frames
        .iter()
        .filter_map(|f| match &f.event {
            SegmentEvent::ActionComplete { id, status, .. } => Some((id.clone(), status.clone())),
            _ => None,
        })
        .collect()
}

pub fn frame_index(frames: &[EventFrame], pred: impl Fn(&SegmentEvent) -> bool) -> Option<usize> {
    frames.iter().position(|f| pred(&f.event))
}

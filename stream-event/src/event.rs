//! Wire-level segment events (type + payload).
//!
//! Kind/mode/status fields are plain strings here so consumers do not need the
//! engine's enums; the engine renders its own types into these.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage aggregated over a session, attached to `session_end`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One segment event: wire shape is a tagged object (`type` + payload fields).
/// The frame envelope (`seq`, `session_id`) is applied separately by [`crate::FrameSeq`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentEvent {
    /// Incremental text inside a `<thought>` tag.
    ThoughtChunk { content: String },
    /// Incremental text inside a `<response>` tag; `last` marks the terminal response.
    ResponseChunk {
        content: String,
        #[serde(rename = "final")]
        last: bool,
    },
    /// An action descriptor was accepted for scheduling.
    ActionStart {
        id: String,
        kind: String,
        mode: String,
        name: String,
    },
    /// An action reached a terminal state (ok, error, timeout, cancelled).
    ActionComplete {
        id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        started_at: String,
        ended_at: String,
    },
    /// A context feed gained a new value (iteration start, refresh, or dynamic update).
    ContextFeedUpdate { id: String, value: String },
    /// Validated metadata fields were merged into the session state.
    MetadataUpdate { fields: Value },
    /// Non-fatal condition; also injected into the next iteration's prompt.
    SoftError { code: String, message: String },
    /// Separates iterations; `iteration` is 1-based.
    IterationBoundary { iteration: u32 },
    /// Terminal frame of a session stream.
    SessionEnd {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageSummary>,
    },
}

impl SegmentEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thought_chunk_wire_shape() {
        let v = SegmentEvent::ThoughtChunk {
            content: "hm".into(),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "thought_chunk");
        assert_eq!(v["content"], "hm");
    }

    #[test]
    fn response_chunk_serializes_final_key() {
        let v = SegmentEvent::ResponseChunk {
            content: "done".into(),
            last: true,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "response_chunk");
        assert_eq!(v["final"], true);
    }

    #[test]
    fn action_complete_omits_empty_value_and_error() {
        let v = SegmentEvent::ActionComplete {
            id: "a".into(),
            status: "cancelled".into(),
            value: None,
            error: None,
            started_at: "2026-01-01T00:00:00Z".into(),
            ended_at: "2026-01-01T00:00:01Z".into(),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "action_complete");
        assert!(v.get("value").is_none());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn session_end_round_trips() {
        let ev = SegmentEvent::SessionEnd {
            reason: "done".into(),
            usage: Some(UsageSummary {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        };
        let v = ev.to_value().unwrap();
        let back: SegmentEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}

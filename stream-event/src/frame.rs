//! Frame envelope: seq + session_id wrapped around each segment event.
//! `FrameSeq` hands out contiguous, strictly increasing sequence numbers.

use serde::{Deserialize, Serialize};

use crate::event::SegmentEvent;

/// One output frame: monotonic `seq`, owning `session_id`, flattened event.
///
/// Wire shape: `{"seq":1,"session_id":"…","type":"response_chunk",…}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub seq: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub event: SegmentEvent,
}

impl EventFrame {
    /// Renders this frame as one server-sent-events message (`data: {json}\n\n`).
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Sequence state for one session: assigns `seq` starting at 1, no gaps.
pub struct FrameSeq {
    session_id: String,
    next: u64,
}

impl FrameSeq {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next: 1,
        }
    }

    /// Wraps an event into the next frame and advances the counter.
    pub fn frame(&mut self, event: SegmentEvent) -> EventFrame {
        let frame = EventFrame {
            seq: self.next,
            session_id: self.session_id.clone(),
            event,
        };
        self.next += 1;
        frame
    }

    /// The seq the next frame will carry.
    pub fn peek_next(&self) -> u64 {
        self.next
    }
}

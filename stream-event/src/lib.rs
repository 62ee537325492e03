//! Segment event protocol: type + payload + sequenced frame envelope.
//!
//! This crate defines the wire shape of one engine output event and its frame
//! (seq + session_id). It does not depend on the engine; the engine constructs
//! `SegmentEvent`s and wraps them through `FrameSeq`.

pub mod event;
pub mod frame;

pub use event::{SegmentEvent, UsageSummary};
pub use frame::{EventFrame, FrameSeq};

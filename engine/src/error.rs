//! Engine error types.
//!
//! Errors never cross the session boundary as panics or `Err` to the consumer;
//! the run loop converts them into event frames. These types flow between
//! components inside the engine.

use thiserror::Error;

use crate::llm::BackendError;

/// Session-fatal failures: the run loop maps these to a terminal
/// `session_end` frame with an error reason.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The LLM backend failed in a way the session cannot recover from.
    #[error("llm backend: {0}")]
    Backend(#[from] BackendError),

    /// An internal invariant was violated (impossible state).
    #[error("engine invariant violated: {0}")]
    Invariant(String),
}

/// Soft-error classes (spec-level taxonomy). Rendered as `soft_error` frames
/// and injected into the next iteration's prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftErrorCode {
    StrayText,
    UnknownTag,
    MalformedTag,
    MalformedActionBody,
    DisallowedNesting,
    UnterminatedTag,
    UnresolvedVariable,
    DuplicateOutputKey,
    DuplicateActionId,
    DuplicateFinalResponse,
    DetachedOutputKey,
    MetadataNotObject,
    UnknownMetadataField,
    MetadataTypeMismatch,
    MetadataEnumViolation,
    FeedTruncated,
    FeedUnavailable,
    IterationCapExceeded,
    IterationFatal,
}

impl SoftErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrayText => "stray_text",
            Self::UnknownTag => "unknown_tag",
            Self::MalformedTag => "malformed_tag",
            Self::MalformedActionBody => "malformed_action_body",
            Self::DisallowedNesting => "disallowed_nesting",
            Self::UnterminatedTag => "unterminated_tag",
            Self::UnresolvedVariable => "unresolved_variable",
            Self::DuplicateOutputKey => "duplicate_output_key",
            Self::DuplicateActionId => "duplicate_action_id",
            Self::DuplicateFinalResponse => "duplicate_final_response",
            Self::DetachedOutputKey => "detached_output_key",
            Self::MetadataNotObject => "metadata_not_object",
            Self::UnknownMetadataField => "unknown_metadata_field",
            Self::MetadataTypeMismatch => "metadata_type_mismatch",
            Self::MetadataEnumViolation => "metadata_enum_violation",
            Self::FeedTruncated => "feed_truncated",
            Self::FeedUnavailable => "feed_unavailable",
            Self::IterationCapExceeded => "iteration_cap_exceeded",
            Self::IterationFatal => "iteration_fatal",
        }
    }
}

/// One soft error: class + human-readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftError {
    pub code: SoftErrorCode,
    pub message: String,
}

impl SoftError {
    pub fn new(code: SoftErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SoftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

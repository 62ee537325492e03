//! Action model: descriptors parsed from the protocol stream and the terminal
//! results the dispatcher produces for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Capability family an action targets. Fixed enumeration; the parser rejects
/// anything else with a soft error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tool,
    Agent,
    Relic,
    Workflow,
    Llm,
    Internal,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Relic => "relic",
            Self::Workflow => "workflow",
            Self::Llm => "llm",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(Self::Tool),
            "agent" => Some(Self::Agent),
            "relic" => Some(Self::Relic),
            "workflow" => Some(Self::Workflow),
            "llm" => Some(Self::Llm),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Scheduling mode. `sync` and `async` are tracked in the completion barrier;
/// `fire_and_forget` actions are detached and cannot bind variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    Sync,
    Async,
    FireAndForget,
}

impl ActionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::FireAndForget => "fire_and_forget",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            "fire_and_forget" => Some(Self::FireAndForget),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, Self::FireAndForget)
    }
}

/// What happens to this action when a predecessor fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Cancelled together with the failing predecessor's other descendants.
    #[default]
    Cancel,
    /// Still runs once all predecessors have reached a terminal state.
    Continue,
}

/// Where the action tag appeared in the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOrigin {
    TopLevel,
    InThought,
}

/// JSON body of an `<action>` tag.
#[derive(Debug, Deserialize)]
struct ActionBody {
    name: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    output_key: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    /// Seconds; fractional values allowed.
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    retry: Option<u32>,
    #[serde(default)]
    on_error: Option<OnErrorPolicy>,
}

/// One action declared by the LLM, ready for scheduling.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionDescriptor {
    /// Unique within the iteration; generated when the tag had no `id`.
    pub id: String,
    pub kind: ActionKind,
    pub mode: ActionMode,
    pub name: String,
    /// Parameter tree; `$name` references are resolved at dispatch time.
    pub parameters: Value,
    pub output_key: Option<String>,
    pub depends_on: Vec<String>,
    pub timeout: Option<std::time::Duration>,
    pub retry: u32,
    pub on_error: OnErrorPolicy,
    pub origin: ActionOrigin,
    /// Declaration position within the iteration, 0-based.
    pub index: usize,
}

#[derive(Debug, Error)]
pub enum ActionBodyError {
    #[error("action body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("action body missing required field: {0}")]
    MissingField(&'static str),
}

impl ActionDescriptor {
    /// Builds a descriptor from tag attributes and the raw JSON body.
    /// `index` is the creation index; a missing `id` becomes `act-{index}`.
    pub fn from_body(
        body: &str,
        kind: ActionKind,
        mode: ActionMode,
        id: Option<String>,
        origin: ActionOrigin,
        index: usize,
    ) -> Result<Self, ActionBodyError> {
        let body: ActionBody = serde_json::from_str(body)?;
        if body.name.is_empty() {
            return Err(ActionBodyError::MissingField("name"));
        }
        let parameters = match body.parameters {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        Ok(Self {
            id: id.unwrap_or_else(|| format!("act-{index}")),
            kind,
            mode,
            name: body.name,
            parameters,
            output_key: body.output_key,
            depends_on: body.depends_on,
            timeout: body.timeout.map(std::time::Duration::from_secs_f64),
            retry: body.retry.unwrap_or(0),
            on_error: body.on_error.unwrap_or_default(),
            origin,
            index,
        })
    }
}

/// Terminal status of one action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Terminal record for one action, carried on the `action_complete` frame.
#[derive(Clone, Debug)]
pub struct ActionResult {
    pub id: String,
    pub status: ActionStatus,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
}

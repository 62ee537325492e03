//! Workflow triggers: field-value conditions evaluated against the metadata
//! state after every commit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// AND or OR over a trigger's conditions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// One condition: a dot path into the metadata state and the expected value.
/// A list expected value matches by membership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub path: String,
    pub expected: Value,
}

/// A workflow spawned when its conditions hold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub workflow: String,
    #[serde(default)]
    pub mode: MatchMode,
    pub conditions: Vec<TriggerCondition>,
}

/// Traverses a dot-separated path through nested objects.
fn lookup_path<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = state;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn condition_holds(state: &Value, condition: &TriggerCondition) -> bool {
    let Some(actual) = lookup_path(state, &condition.path) else {
        return false;
    };
    match &condition.expected {
        Value::Array(options) => options.iter().any(|o| o == actual),
        expected => expected == actual,
    }
}

impl WorkflowTrigger {
    /// Whether this trigger matches the given metadata state. A trigger with
    /// no conditions never fires.
    pub fn matches(&self, state: &Value) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::All => self.conditions.iter().all(|c| condition_holds(state, c)),
            MatchMode::Any => self.conditions.iter().any(|c| condition_holds(state, c)),
        }
    }
}

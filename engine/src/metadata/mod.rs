//! Metadata engine: schema-validated session state declared by the LLM, and
//! the trigger evaluation that runs after every commit.
//!
//! Validation is type-level only. Invalid fields are collected as soft errors
//! for the next prompt and never applied, so every committed change is one the
//! schema allows.

mod triggers;

pub use triggers::{MatchMode, TriggerCondition, WorkflowTrigger};

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SoftError, SoftErrorCode};

/// Declared type of one metadata field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Enum,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// One field of the agent-declared metadata schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub kind: FieldKind,
    /// Membership list for `enum` fields.
    #[serde(default)]
    pub allowed: Vec<Value>,
    #[serde(default)]
    pub default: Option<Value>,
}

impl MetadataField {
    fn validate(&self, value: &Value) -> Result<(), SoftError> {
        let ok = match self.kind {
            FieldKind::Enum => {
                if !value.is_string() && !value.is_number() {
                    false
                } else if self.allowed.iter().any(|a| a == value) {
                    true
                } else {
                    return Err(SoftError::new(
                        SoftErrorCode::MetadataEnumViolation,
                        format!(
                            "field '{}' value {value} is not one of the allowed values",
                            self.name
                        ),
                    ));
                }
            }
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        };
        if ok {
            Ok(())
        } else {
            Err(SoftError::new(
                SoftErrorCode::MetadataTypeMismatch,
                format!("field '{}' expects {:?}, got {value}", self.name, self.kind),
            ))
        }
    }
}

/// Result of applying one `<metadata>` payload.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Fields that passed validation and were merged.
    pub applied: Map<String, Value>,
    pub soft_errors: Vec<SoftError>,
    /// Workflows whose triggers match the post-commit state.
    pub fired: Vec<WorkflowTrigger>,
}

/// Session-scoped metadata state plus its schema and triggers.
pub struct MetadataEngine {
    schema: Vec<MetadataField>,
    triggers: Vec<WorkflowTrigger>,
    state: Mutex<Map<String, Value>>,
}

impl MetadataEngine {
    /// Initializes state from the schema's declared defaults.
    pub fn new(schema: Vec<MetadataField>, triggers: Vec<WorkflowTrigger>) -> Self {
        let mut state = Map::new();
        for field in &schema {
            if let Some(default) = &field.default {
                state.insert(field.name.clone(), default.clone());
            }
        }
        Self {
            schema,
            triggers,
            state: Mutex::new(state),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> Value {
        Value::Object(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// One-line summary for prompt assembly; None when the state is empty.
    pub fn summary(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_empty() {
            return None;
        }
        serde_json::to_string(&*state).ok()
    }

    /// Validates and merges a `<metadata>` payload, then evaluates triggers
    /// against the post-commit state.
    pub fn apply(&self, payload: &Value) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let Some(updates) = payload.as_object() else {
            outcome.soft_errors.push(SoftError::new(
                SoftErrorCode::MetadataNotObject,
                format!("metadata payload must be a JSON object, got {payload}"),
            ));
            return outcome;
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (name, value) in updates {
            let Some(field) = self.schema.iter().find(|f| &f.name == name) else {
                outcome.soft_errors.push(SoftError::new(
                    SoftErrorCode::UnknownMetadataField,
                    format!("metadata field '{name}' is not declared in the schema"),
                ));
                continue;
            };
            match field.validate(value) {
                Ok(()) => {
                    state.insert(name.clone(), value.clone());
                    outcome.applied.insert(name.clone(), value.clone());
                }
                Err(soft) => outcome.soft_errors.push(soft),
            }
        }
        if !outcome.applied.is_empty() {
            let snapshot = Value::Object(state.clone());
            drop(state);
            outcome.fired = self
                .triggers
                .iter()
                .filter(|t| t.matches(&snapshot))
                .cloned()
                .collect();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_schema() -> Vec<MetadataField> {
        vec![
            MetadataField {
                name: "status".into(),
                kind: FieldKind::Enum,
                allowed: vec![json!("A"), json!("B"), json!("C"), json!("CODING")],
                default: Some(json!("A")),
            },
            MetadataField {
                name: "progress".into(),
                kind: FieldKind::Number,
                allowed: vec![],
                default: None,
            },
            MetadataField {
                name: "task".into(),
                kind: FieldKind::Object,
                allowed: vec![],
                default: None,
            },
        ]
    }

    #[test]
    fn defaults_initialize_state() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        assert_eq!(engine.state(), json!({"status": "A"}));
    }

    #[test]
    fn valid_update_is_applied() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        let outcome = engine.apply(&json!({"status": "B", "progress": 40}));
        assert_eq!(outcome.applied.len(), 2);
        assert!(outcome.soft_errors.is_empty());
        assert_eq!(engine.state(), json!({"status": "B", "progress": 40}));
    }

    #[test]
    fn enum_violation_leaves_state_unchanged() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        let outcome = engine.apply(&json!({"status": "TYPO"}));
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.soft_errors.len(), 1);
        assert_eq!(
            outcome.soft_errors[0].code,
            SoftErrorCode::MetadataEnumViolation
        );
        assert_eq!(engine.state(), json!({"status": "A"}));
    }

    #[test]
    fn unknown_field_is_soft_error_but_valid_siblings_apply() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        let outcome = engine.apply(&json!({"status": "C", "mystery": 1}));
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.soft_errors.len(), 1);
        assert_eq!(
            outcome.soft_errors[0].code,
            SoftErrorCode::UnknownMetadataField
        );
        assert_eq!(engine.state()["status"], "C");
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        let outcome = engine.apply(&json!({"progress": "lots"}));
        assert!(outcome.applied.is_empty());
        assert_eq!(
            outcome.soft_errors[0].code,
            SoftErrorCode::MetadataTypeMismatch
        );
    }

    #[test]
    fn non_object_payload_is_discarded() {
        let engine = MetadataEngine::new(status_schema(), vec![]);
        let outcome = engine.apply(&json!([1, 2]));
        assert_eq!(outcome.soft_errors[0].code, SoftErrorCode::MetadataNotObject);
        assert_eq!(engine.state(), json!({"status": "A"}));
    }

    #[test]
    fn matching_trigger_fires_after_commit() {
        let trigger = WorkflowTrigger {
            workflow: "doc_update".into(),
            mode: MatchMode::All,
            conditions: vec![TriggerCondition {
                path: "status".into(),
                expected: json!("CODING"),
            }],
        };
        let engine = MetadataEngine::new(status_schema(), vec![trigger]);
        let outcome = engine.apply(&json!({"status": "CODING"}));
        assert_eq!(outcome.fired.len(), 1);
        assert_eq!(outcome.fired[0].workflow, "doc_update");
        // Rejected update does not re-fire.
        let outcome = engine.apply(&json!({"status": "NOPE"}));
        assert!(outcome.fired.is_empty());
    }

    #[test]
    fn nested_trigger_path_sees_object_field() {
        let trigger = WorkflowTrigger {
            workflow: "phase_watch".into(),
            mode: MatchMode::All,
            conditions: vec![TriggerCondition {
                path: "task.phase".into(),
                expected: json!("build"),
            }],
        };
        let engine = MetadataEngine::new(status_schema(), vec![trigger]);
        let outcome = engine.apply(&json!({"task": {"phase": "build"}}));
        assert_eq!(outcome.fired.len(), 1);
    }

    #[test]
    fn summary_reflects_state() {
        let engine = MetadataEngine::new(vec![], vec![]);
        assert!(engine.summary().is_none());
        let engine = MetadataEngine::new(status_schema(), vec![]);
        assert!(engine.summary().unwrap_or_default().contains("status"));
    }
}

//! Variable store: write-once keyed buffer for action outputs.
//!
//! Producers (the dispatcher, `internal` actions) write under an `output_key`;
//! consumers (parameter resolution, the response buffer) read or subscribe.
//! A key is written at most once; a second write is reported, never applied.

mod subst;

pub use subst::{
    param_refs, render_value, scan_refs, substitute_params, substitute_text, Substitution,
};

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Resolution of one subscribed key.
#[derive(Clone, Debug, PartialEq)]
pub enum VarOutcome {
    /// The producer completed and bound this value.
    Ready(Value),
    /// The producer reached a terminal non-ok state; the key stays unbound.
    Failed(String),
}

/// One bound variable.
#[derive(Clone, Debug)]
pub struct VariableEntry {
    pub value: Value,
    pub producer: String,
    pub written_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarStoreError {
    #[error("output key '{0}' already written by action '{1}'")]
    KeyExists(String, String),
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, VariableEntry>,
    failed: HashMap<String, String>,
    waiters: HashMap<String, Vec<oneshot::Sender<VarOutcome>>>,
}

/// Session-scoped variable store. Writes are serialized by the internal lock;
/// a reader sees an entry entirely or not at all.
#[derive(Default)]
pub struct VariableStore {
    inner: Mutex<Inner>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key`. Fails without overwriting if the key is already bound.
    /// Waiters subscribed to the key are woken with the value.
    pub fn put(&self, key: &str, value: Value, producer: &str) -> Result<(), VarStoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.entries.get(key) {
            return Err(VarStoreError::KeyExists(
                key.to_string(),
                existing.producer.clone(),
            ));
        }
        inner.failed.remove(key);
        inner.entries.insert(
            key.to_string(),
            VariableEntry {
                value: value.clone(),
                producer: producer.to_string(),
                written_at: chrono::Utc::now(),
            },
        );
        for tx in inner.waiters.remove(key).unwrap_or_default() {
            let _ = tx.send(VarOutcome::Ready(value.clone()));
        }
        Ok(())
    }

    /// Marks `key` as failed (producer errored); wakes waiters with the error.
    /// A later `put` under the same key is still allowed (e.g. a retried
    /// producer in a later iteration).
    pub fn fail(&self, key: &str, error: impl Into<String>) {
        let error = error.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.contains_key(key) {
            return;
        }
        inner.failed.insert(key.to_string(), error.clone());
        for tx in inner.waiters.remove(key).unwrap_or_default() {
            let _ = tx.send(VarOutcome::Failed(error.clone()));
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.contains_key(key)
    }

    /// Removes a binding (the `delete_variable` internal operation).
    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key).is_some()
    }

    /// One-shot subscription: resolves immediately when the key is already
    /// bound or failed, otherwise when the producer reports.
    pub fn subscribe(&self, key: &str) -> oneshot::Receiver<VarOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.entries.get(key) {
            let _ = tx.send(VarOutcome::Ready(entry.value.clone()));
        } else if let Some(err) = inner.failed.get(key) {
            let _ = tx.send(VarOutcome::Failed(err.clone()));
        } else {
            inner.waiters.entry(key.to_string()).or_default().push(tx);
        }
        rx
    }

    /// Clears failure marks at an iteration boundary so a key that never bound
    /// can be produced fresh by the next iteration's actions.
    pub fn begin_iteration(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failed.clear();
        inner.waiters.clear();
    }

    /// Snapshot of bound keys, for diagnostics and the internal `list` ops.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = inner.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_then_get() {
        let store = VariableStore::new();
        store.put("x", json!(41), "a").unwrap();
        assert_eq!(store.get("x"), Some(json!(41)));
        assert!(store.contains("x"));
        assert!(!store.contains("y"));
    }

    #[test]
    fn second_put_fails_and_keeps_first_value() {
        let store = VariableStore::new();
        store.put("x", json!("first"), "a").unwrap();
        let err = store.put("x", json!("second"), "b").unwrap_err();
        assert_eq!(err, VarStoreError::KeyExists("x".into(), "a".into()));
        assert_eq!(store.get("x"), Some(json!("first")));
    }

    #[tokio::test]
    async fn subscribe_before_put_resolves_on_write() {
        let store = VariableStore::new();
        let rx = store.subscribe("x");
        store.put("x", json!({"n": 1}), "a").unwrap();
        assert_eq!(rx.await.unwrap(), VarOutcome::Ready(json!({"n": 1})));
    }

    #[tokio::test]
    async fn subscribe_after_put_resolves_immediately() {
        let store = VariableStore::new();
        store.put("x", json!(true), "a").unwrap();
        let rx = store.subscribe("x");
        assert_eq!(rx.await.unwrap(), VarOutcome::Ready(json!(true)));
    }

    #[tokio::test]
    async fn fail_wakes_waiters_with_error() {
        let store = VariableStore::new();
        let rx = store.subscribe("x");
        store.fail("x", "tool exploded");
        assert_eq!(rx.await.unwrap(), VarOutcome::Failed("tool exploded".into()));
        // Failure does not bind the key.
        assert!(!store.contains("x"));
        // A fresh subscription still sees the failure mark.
        let rx2 = store.subscribe("x");
        assert!(matches!(rx2.await.unwrap(), VarOutcome::Failed(_)));
    }

    #[test]
    fn begin_iteration_clears_failure_marks_only() {
        let store = VariableStore::new();
        store.put("kept", json!(1), "a").unwrap();
        store.fail("gone", "err");
        store.begin_iteration();
        assert!(store.contains("kept"));
        store.put("gone", json!(2), "b").unwrap();
        assert_eq!(store.get("gone"), Some(json!(2)));
    }

    #[test]
    fn delete_removes_binding() {
        let store = VariableStore::new();
        store.put("x", json!(1), "a").unwrap();
        assert!(store.delete("x"));
        assert!(!store.delete("x"));
        assert!(!store.contains("x"));
    }
}

//! Internal adapter: operations served inside the engine itself, gated by the
//! agent configuration's allowlist. Denied operations fail non-retryably.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::action::ActionKind;
use crate::feeds::{FeedConfig, FeedManager, FeedPatch};
use crate::llm::ChatMessage;
use crate::vars::VariableStore;

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

/// Session state the internal operations act on.
pub struct InternalContext {
    pub feeds: Arc<FeedManager>,
    pub vars: Arc<VariableStore>,
    pub history: Arc<StdMutex<Vec<ChatMessage>>>,
}

pub struct InternalAdapter {
    ctx: InternalContext,
    allowlist: HashSet<String>,
}

#[derive(Deserialize)]
struct AddFeedParams {
    feed: FeedConfig,
}

#[derive(Deserialize)]
struct FeedIdParams {
    id: String,
}

#[derive(Deserialize)]
struct UpdateFeedParams {
    id: String,
    #[serde(flatten)]
    patch: FeedPatch,
}

#[derive(Deserialize)]
struct SetVariableParams {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct DeleteVariableParams {
    key: String,
}

impl InternalAdapter {
    pub fn new(ctx: InternalContext, allowlist: impl IntoIterator<Item = String>) -> Self {
        Self {
            ctx,
            allowlist: allowlist.into_iter().collect(),
        }
    }

    fn params<T: serde::de::DeserializeOwned>(
        op: &str,
        parameters: Value,
    ) -> Result<T, CapabilityError> {
        serde_json::from_value(parameters)
            .map_err(|e| CapabilityError::permanent(format!("{op} parameters: {e}")))
    }
}

#[async_trait]
impl CapabilityAdapter for InternalAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Internal
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        if !self.allowlist.contains(req.name) {
            return Err(CapabilityError::permanent(format!(
                "internal operation '{}' is not permitted for this agent",
                req.name
            )));
        }
        match req.name {
            "add_context_feed" => {
                let p: AddFeedParams = Self::params(req.name, req.parameters)?;
                let id = p.feed.id.clone();
                self.ctx
                    .feeds
                    .add(p.feed)
                    .await
                    .map_err(|e| CapabilityError::permanent(e.to_string()))?;
                Ok(json!({ "added": id }))
            }
            "remove_context_feed" => {
                let p: FeedIdParams = Self::params(req.name, req.parameters)?;
                self.ctx
                    .feeds
                    .remove(&p.id)
                    .await
                    .map_err(|e| CapabilityError::permanent(e.to_string()))?;
                Ok(json!({ "removed": p.id }))
            }
            "update_context_feed" => {
                let p: UpdateFeedParams = Self::params(req.name, req.parameters)?;
                self.ctx
                    .feeds
                    .update(&p.id, p.patch)
                    .await
                    .map_err(|e| CapabilityError::permanent(e.to_string()))?;
                Ok(json!({ "updated": p.id }))
            }
            "list_context_feeds" => Ok(self.ctx.feeds.list().await),
            "set_variable" => {
                let p: SetVariableParams = Self::params(req.name, req.parameters)?;
                self.ctx
                    .vars
                    .put(&p.key, p.value, "internal:set_variable")
                    .map_err(|e| CapabilityError::permanent(e.to_string()))?;
                Ok(json!({ "set": p.key }))
            }
            "delete_variable" => {
                let p: DeleteVariableParams = Self::params(req.name, req.parameters)?;
                let existed = self.ctx.vars.delete(&p.key);
                Ok(json!({ "deleted": p.key, "existed": existed }))
            }
            "clear_context" => {
                let cleared = {
                    let mut history =
                        self.ctx.history.lock().unwrap_or_else(|e| e.into_inner());
                    let n = history.len();
                    history.clear();
                    n
                };
                Ok(json!({ "cleared_messages": cleared }))
            }
            other => Err(CapabilityError::permanent(format!(
                "unknown internal operation '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionMode;
    use crate::emitter::{EventEmitter, SoftQueue};
    use tokio_util::sync::CancellationToken;

    fn adapter(allow: &[&str]) -> InternalAdapter {
        let vars = Arc::new(VariableStore::new());
        let (emitter, rx) =
            EventEmitter::new("s", 64, Arc::clone(&vars), Arc::new(SoftQueue::new()));
        drop(rx);
        let feeds = FeedManager::new(emitter, CancellationToken::new(), true);
        InternalAdapter::new(
            InternalContext {
                feeds,
                vars,
                history: Arc::new(StdMutex::new(vec![ChatMessage::user("hi")])),
            },
            allow.iter().map(|s| s.to_string()),
        )
    }

    async fn call(a: &InternalAdapter, name: &str, params: Value) -> Result<Value, CapabilityError> {
        let cancel = CancellationToken::new();
        a.invoke(CapabilityRequest {
            name,
            parameters: params,
            mode: ActionMode::Sync,
            cancel: &cancel,
        })
        .await
    }

    #[tokio::test]
    async fn denied_operation_is_permanent_error() {
        let a = adapter(&["list_context_feeds"]);
        let err = call(&a, "clear_context", json!({})).await.unwrap_err();
        assert!(!err.transient);
        assert!(err.message.contains("not permitted"));
    }

    #[tokio::test]
    async fn set_and_delete_variable() {
        let a = adapter(&["set_variable", "delete_variable"]);
        call(&a, "set_variable", json!({"key": "k", "value": 7}))
            .await
            .unwrap();
        assert_eq!(a.ctx.vars.get("k"), Some(json!(7)));
        // Write-once holds for internal writes too.
        assert!(call(&a, "set_variable", json!({"key": "k", "value": 8}))
            .await
            .is_err());
        let out = call(&a, "delete_variable", json!({"key": "k"})).await.unwrap();
        assert_eq!(out["existed"], true);
        assert!(!a.ctx.vars.contains("k"));
    }

    #[tokio::test]
    async fn feed_lifecycle_via_internal_ops() {
        let a = adapter(&[
            "add_context_feed",
            "update_context_feed",
            "list_context_feeds",
            "remove_context_feed",
        ]);
        call(
            &a,
            "add_context_feed",
            json!({"feed": {"id": "notes", "kind": "on_demand"}}),
        )
        .await
        .unwrap();
        call(
            &a,
            "update_context_feed",
            json!({"id": "notes", "value": "remember"}),
        )
        .await
        .unwrap();
        let list = call(&a, "list_context_feeds", json!({})).await.unwrap();
        assert_eq!(list[0]["id"], "notes");
        assert_eq!(list[0]["has_value"], true);
        call(&a, "remove_context_feed", json!({"id": "notes"}))
            .await
            .unwrap();
        let list = call(&a, "list_context_feeds", json!({})).await.unwrap();
        assert_eq!(list.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn clear_context_empties_history() {
        let a = adapter(&["clear_context"]);
        let out = call(&a, "clear_context", json!({})).await.unwrap();
        assert_eq!(out["cleared_messages"], 1);
        assert!(a.ctx.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_allowed_operation_still_fails() {
        let a = adapter(&["frobnicate"]);
        let err = call(&a, "frobnicate", json!({})).await.unwrap_err();
        assert!(err.message.contains("unknown internal operation"));
    }
}

//! Context-feed manager: the per-session registry of named feeds injected
//! into each iteration's prompt.
//!
//! on_demand feeds refresh lazily behind a TTL cache; each periodic feed owns
//! a refresh task; internal feeds compute on read. The injection snapshot is
//! taken once at iteration start, so dynamic mutations land in the next
//! iteration. No lock is held across a source invocation.

mod internal;

pub use internal::InternalSource;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stream_event::SegmentEvent;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::action::{ActionKind, ActionMode};
use crate::capability::{AdapterRegistry, CapabilityRequest};
use crate::emitter::EventEmitter;
use crate::error::{SoftError, SoftErrorCode};

/// Refresh/source discipline of one feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Pulled in the prompt-assembly path, cached for `ttl_secs`.
    #[default]
    OnDemand,
    /// Refreshed out of band on `interval_secs`; injection reads the cache.
    Periodic,
    /// Built-in source (clock, random, env, process metrics).
    Internal,
    /// on_demand against the named capability kind.
    Relic,
    Tool,
    Workflow,
    Llm,
}

/// Where a non-internal feed's value comes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedSource {
    /// Adapter kind for `on_demand` / `periodic` feeds; implied by `FeedKind`
    /// for the kind-specific variants.
    #[serde(default)]
    pub adapter: Option<ActionKind>,
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

fn default_true() -> bool {
    true
}

/// Declared configuration of one feed (from the agent configuration or a
/// dynamic `add_context_feed` action).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    #[serde(default)]
    pub kind: FeedKind,
    #[serde(default)]
    pub source: Option<FeedSource>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub max_size_bytes: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FeedConfig {
    pub fn new(id: impl Into<String>, kind: FeedKind) -> Self {
        Self {
            id: id.into(),
            kind,
            source: None,
            interval_secs: None,
            ttl_secs: None,
            max_tokens: None,
            max_size_bytes: None,
            enabled: true,
        }
    }

    /// Adapter kind + source for a fetched feed; None for internal feeds.
    fn adapter_source(&self) -> Option<(ActionKind, &FeedSource)> {
        let source = self.source.as_ref()?;
        let kind = match self.kind {
            FeedKind::Relic => ActionKind::Relic,
            FeedKind::Tool => ActionKind::Tool,
            FeedKind::Workflow => ActionKind::Workflow,
            FeedKind::Llm => ActionKind::Llm,
            FeedKind::OnDemand | FeedKind::Periodic => source.adapter.unwrap_or(ActionKind::Tool),
            FeedKind::Internal => return None,
        };
        Some((kind, source))
    }
}

/// Fields a dynamic `update_context_feed` operation may change.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FeedPatch {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed '{0}' already exists")]
    Duplicate(String),
    #[error("feed '{0}' not found")]
    NotFound(String),
}

struct Cached {
    value: String,
    fetched_at: Instant,
}

struct FeedEntry {
    config: StdMutex<FeedConfig>,
    cache: StdMutex<Option<Cached>>,
    refresh_cancel: StdMutex<Option<CancellationToken>>,
}

impl FeedEntry {
    fn new(config: FeedConfig) -> Arc<Self> {
        Arc::new(Self {
            config: StdMutex::new(config),
            cache: StdMutex::new(None),
            refresh_cancel: StdMutex::new(None),
        })
    }

    fn config(&self) -> FeedConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn cached_value(&self) -> Option<(String, Instant)> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| (c.value.clone(), c.fetched_at))
    }

    fn store_value(&self, value: String) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(Cached {
            value,
            fetched_at: Instant::now(),
        });
    }

    fn stop_refresher(&self) {
        if let Some(token) = self
            .refresh_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }
}

/// Per-session feed registry.
pub struct FeedManager {
    feeds: RwLock<HashMap<String, Arc<FeedEntry>>>,
    /// Set once the adapter registry exists (it owns the internal adapter,
    /// which in turn holds this manager).
    adapters: once_cell::sync::OnceCell<Arc<AdapterRegistry>>,
    emitter: Arc<EventEmitter>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    periodic_enabled: bool,
}

impl FeedManager {
    pub fn new(
        emitter: Arc<EventEmitter>,
        cancel: CancellationToken,
        periodic_enabled: bool,
    ) -> Arc<Self> {
        internal::init_process_clock();
        Arc::new(Self {
            feeds: RwLock::new(HashMap::new()),
            adapters: once_cell::sync::OnceCell::new(),
            emitter,
            cancel,
            tracker: TaskTracker::new(),
            periodic_enabled,
        })
    }

    /// Wires the adapter registry after construction (breaks the
    /// manager/internal-adapter cycle). Only the first call takes effect.
    pub fn set_adapters(&self, adapters: Arc<AdapterRegistry>) {
        let _ = self.adapters.set(adapters);
    }

    /// Registers a feed. Periodic feeds start refreshing from add time.
    pub async fn add(self: &Arc<Self>, config: FeedConfig) -> Result<(), FeedError> {
        let id = config.id.clone();
        let entry = {
            let mut feeds = self.feeds.write().await;
            if feeds.contains_key(&id) {
                return Err(FeedError::Duplicate(id));
            }
            let entry = FeedEntry::new(config);
            feeds.insert(id.clone(), Arc::clone(&entry));
            entry
        };
        self.maybe_spawn_refresher(&entry);
        Ok(())
    }

    /// Removes a feed and stops its refresher.
    pub async fn remove(&self, id: &str) -> Result<(), FeedError> {
        let entry = {
            let mut feeds = self.feeds.write().await;
            feeds.remove(id).ok_or_else(|| FeedError::NotFound(id.to_string()))?
        };
        entry.stop_refresher();
        Ok(())
    }

    /// Applies a dynamic patch. A value patch overrides the cache; interval or
    /// enabled changes restart the refresher as needed.
    pub async fn update(self: &Arc<Self>, id: &str, patch: FeedPatch) -> Result<(), FeedError> {
        let entry = self.entry(id).await.ok_or_else(|| FeedError::NotFound(id.to_string()))?;
        {
            let mut config = entry.config.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(enabled) = patch.enabled {
                config.enabled = enabled;
            }
            if let Some(interval) = patch.interval_secs {
                config.interval_secs = Some(interval);
            }
            if let Some(ttl) = patch.ttl_secs {
                config.ttl_secs = Some(ttl);
            }
        }
        if let Some(value) = patch.value {
            entry.store_value(value.clone());
            self.emitter
                .emit(SegmentEvent::ContextFeedUpdate {
                    id: id.to_string(),
                    value,
                })
                .await;
        }
        entry.stop_refresher();
        self.maybe_spawn_refresher(&entry);
        Ok(())
    }

    /// Records the body of a `<context_feed>` tag as the feed's current value,
    /// creating an ad-hoc on_demand feed when the id is new.
    pub async fn override_value(self: &Arc<Self>, id: &str, value: String) {
        let entry = match self.entry(id).await {
            Some(entry) => entry,
            None => {
                let entry = FeedEntry::new(FeedConfig::new(id, FeedKind::OnDemand));
                self.feeds
                    .write()
                    .await
                    .insert(id.to_string(), Arc::clone(&entry));
                entry
            }
        };
        entry.store_value(value.clone());
        self.emitter
            .emit(SegmentEvent::ContextFeedUpdate {
                id: id.to_string(),
                value,
            })
            .await;
    }

    /// Injection snapshot: {id -> value} for every enabled feed, plus the soft
    /// errors produced while assembling it (size-cap truncations, fetch
    /// failures). Values are fetched without holding the registry lock.
    pub async fn snapshot(self: &Arc<Self>) -> (Vec<(String, String)>, Vec<SoftError>) {
        let entries: Vec<(String, Arc<FeedEntry>)> = {
            let feeds = self.feeds.read().await;
            let mut list: Vec<_> = feeds
                .iter()
                .map(|(id, e)| (id.clone(), Arc::clone(e)))
                .collect();
            list.sort_by(|a, b| a.0.cmp(&b.0));
            list
        };
        let mut out = Vec::new();
        let mut softs = Vec::new();
        for (id, entry) in entries {
            let config = entry.config();
            if !config.enabled {
                continue;
            }
            match self.current_value(&entry, &config).await {
                Some(raw) => {
                    let (value, truncated) = truncate_feed(&raw, &config);
                    if truncated {
                        softs.push(SoftError::new(
                            SoftErrorCode::FeedTruncated,
                            format!("context feed '{id}' exceeded its size cap and was truncated"),
                        ));
                    }
                    out.push((id, value));
                }
                None => softs.push(SoftError::new(
                    SoftErrorCode::FeedUnavailable,
                    format!("context feed '{id}' has no value available"),
                )),
            }
        }
        (out, softs)
    }

    /// Listing for the `list_context_feeds` internal operation.
    pub async fn list(&self) -> Value {
        let feeds = self.feeds.read().await;
        let mut items: Vec<Value> = feeds
            .values()
            .map(|entry| {
                let config = entry.config();
                json!({
                    "id": config.id,
                    "kind": config.kind,
                    "enabled": config.enabled,
                    "interval_secs": config.interval_secs,
                    "ttl_secs": config.ttl_secs,
                    "has_value": entry.cached_value().is_some(),
                })
            })
            .collect();
        items.sort_by(|a, b| {
            a["id"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["id"].as_str().unwrap_or_default())
        });
        Value::Array(items)
    }

    /// Stops all refreshers and waits for them to wind down.
    pub async fn shutdown(&self) {
        let feeds = self.feeds.read().await;
        for entry in feeds.values() {
            entry.stop_refresher();
        }
        drop(feeds);
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn entry(&self, id: &str) -> Option<Arc<FeedEntry>> {
        self.feeds.read().await.get(id).cloned()
    }

    async fn current_value(&self, entry: &Arc<FeedEntry>, config: &FeedConfig) -> Option<String> {
        match config.kind {
            FeedKind::Internal => {
                let name = config.source.as_ref().map(|s| s.name.as_str())?;
                Some(InternalSource::parse(name)?.value())
            }
            FeedKind::Periodic => {
                if let Some((value, _)) = entry.cached_value() {
                    return Some(value);
                }
                // First injection can precede the first tick; fetch once inline.
                self.fetch(entry, config).await
            }
            _ => {
                if let Some((value, at)) = entry.cached_value() {
                    let fresh = config
                        .ttl_secs
                        .map(|ttl| at.elapsed() < Duration::from_secs(ttl))
                        .unwrap_or(true);
                    if fresh {
                        return Some(value);
                    }
                }
                match self.fetch(entry, config).await {
                    Some(value) => Some(value),
                    // Keep serving a stale value over nothing.
                    None => entry.cached_value().map(|(v, _)| v),
                }
            }
        }
    }

    async fn fetch(&self, entry: &Arc<FeedEntry>, config: &FeedConfig) -> Option<String> {
        let (kind, source) = config.adapter_source()?;
        let adapter = self.adapters.get()?.get(kind)?;
        let cancel = self.cancel.child_token();
        let result = adapter
            .invoke(CapabilityRequest {
                name: &source.name,
                parameters: source.parameters.clone(),
                mode: ActionMode::Sync,
                cancel: &cancel,
            })
            .await;
        match result {
            Ok(value) => {
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                entry.store_value(rendered.clone());
                Some(rendered)
            }
            Err(e) => {
                tracing::warn!(feed = %config.id, "feed fetch failed: {e}");
                None
            }
        }
    }

    fn maybe_spawn_refresher(self: &Arc<Self>, entry: &Arc<FeedEntry>) {
        let config = entry.config();
        if config.kind != FeedKind::Periodic || !config.enabled || !self.periodic_enabled {
            return;
        }
        let Some(interval_secs) = config.interval_secs else {
            tracing::warn!(feed = %config.id, "periodic feed has no interval; not refreshing");
            return;
        };
        let token = self.cancel.child_token();
        *entry
            .refresh_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        let manager = Arc::clone(self);
        let entry = Arc::clone(entry);
        self.tracker.spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick primes the cache.
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let config = entry.config();
                if !config.enabled {
                    continue;
                }
                if let Some(value) = manager.fetch(&entry, &config).await {
                    manager
                        .emitter
                        .emit(SegmentEvent::ContextFeedUpdate {
                            id: config.id.clone(),
                            value,
                        })
                        .await;
                }
            }
        });
    }
}

/// Applies token and byte caps. The token cap uses the 4-bytes-per-token
/// heuristic; both cut on a char boundary and append a visible ellipsis.
fn truncate_feed(value: &str, config: &FeedConfig) -> (String, bool) {
    let byte_cap = [
        config.max_size_bytes,
        config.max_tokens.map(|t| t.saturating_mul(4)),
    ]
    .into_iter()
    .flatten()
    .min();
    let Some(cap) = byte_cap else {
        return (value.to_string(), false);
    };
    if value.len() <= cap {
        return (value.to_string(), false);
    }
    let mut cut = cap;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    (format!("{}…", &value[..cut]), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityAdapter, CapabilityError};
    use crate::emitter::SoftQueue;
    use crate::vars::VariableStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: AtomicUsize,
        value: Value,
    }

    #[async_trait]
    impl CapabilityAdapter for CountingTool {
        fn kind(&self) -> ActionKind {
            ActionKind::Tool
        }

        async fn invoke(&self, _req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    fn manager_with_tool(value: Value) -> (Arc<FeedManager>, Arc<CountingTool>) {
        let vars = Arc::new(VariableStore::new());
        let (emitter, rx) = EventEmitter::new("s", 64, vars, Arc::new(SoftQueue::new()));
        // These tests assert on registry state, not frames; the emitter
        // tolerates the dropped consumer.
        drop(rx);
        let manager = FeedManager::new(emitter, CancellationToken::new(), true);
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            value,
        });
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::clone(&tool) as Arc<dyn CapabilityAdapter>);
        manager.set_adapters(Arc::new(registry));
        (manager, tool)
    }

    fn on_demand_feed(id: &str, ttl: Option<u64>) -> FeedConfig {
        FeedConfig {
            source: Some(FeedSource {
                adapter: None,
                name: "src".into(),
                parameters: Value::Null,
            }),
            ttl_secs: ttl,
            ..FeedConfig::new(id, FeedKind::OnDemand)
        }
    }

    #[tokio::test]
    async fn on_demand_feed_caches_within_ttl() {
        let (manager, tool) = manager_with_tool(json!("v1"));
        manager.add(on_demand_feed("f", Some(3600))).await.unwrap();
        let (snap1, _) = manager.snapshot().await;
        let (snap2, _) = manager.snapshot().await;
        assert_eq!(snap1, vec![("f".to_string(), "v1".to_string())]);
        assert_eq!(snap2, snap1);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_feed_refetches_every_snapshot() {
        let (manager, tool) = manager_with_tool(json!("v"));
        manager.add(on_demand_feed("f", Some(0))).await.unwrap();
        manager.snapshot().await;
        manager.snapshot().await;
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_feed_id_is_rejected() {
        let (manager, _) = manager_with_tool(json!("v"));
        manager.add(FeedConfig::new("f", FeedKind::Internal)).await.unwrap();
        assert_eq!(
            manager.add(FeedConfig::new("f", FeedKind::Internal)).await,
            Err(FeedError::Duplicate("f".into()))
        );
    }

    #[tokio::test]
    async fn disabled_feed_is_omitted_from_snapshot() {
        let (manager, _) = manager_with_tool(json!("v"));
        let mut config = on_demand_feed("off", Some(60));
        config.enabled = false;
        manager.add(config).await.unwrap();
        let (snap, softs) = manager.snapshot().await;
        assert!(snap.is_empty());
        assert!(softs.is_empty());
    }

    #[tokio::test]
    async fn internal_clock_feed_injects_value() {
        let (manager, _) = manager_with_tool(json!("unused"));
        let mut config = FeedConfig::new("now", FeedKind::Internal);
        config.source = Some(FeedSource {
            adapter: None,
            name: "clock".into(),
            parameters: Value::Null,
        });
        manager.add(config).await.unwrap();
        let (snap, _) = manager.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&snap[0].1).is_ok());
    }

    #[tokio::test]
    async fn oversize_feed_is_truncated_with_soft_error() {
        let (manager, _) = manager_with_tool(json!("x".repeat(100)));
        let mut config = on_demand_feed("big", Some(60));
        config.max_size_bytes = Some(10);
        manager.add(config).await.unwrap();
        let (snap, softs) = manager.snapshot().await;
        assert_eq!(snap[0].1, format!("{}…", "x".repeat(10)));
        assert_eq!(softs.len(), 1);
        assert_eq!(softs[0].code, SoftErrorCode::FeedTruncated);
    }

    #[tokio::test]
    async fn override_value_creates_ad_hoc_feed() {
        let (manager, _) = manager_with_tool(json!("unused"));
        manager.override_value("scratch", "noted".into()).await;
        let (snap, _) = manager.snapshot().await;
        assert_eq!(snap, vec![("scratch".to_string(), "noted".to_string())]);
    }

    #[tokio::test]
    async fn update_patch_overrides_value_and_disables() {
        let (manager, _) = manager_with_tool(json!("unused"));
        manager.override_value("f", "one".into()).await;
        manager
            .update(
                "f",
                FeedPatch {
                    value: Some("two".into()),
                    ..FeedPatch::default()
                },
            )
            .await
            .unwrap();
        let (snap, _) = manager.snapshot().await;
        assert_eq!(snap[0].1, "two");
        manager
            .update(
                "f",
                FeedPatch {
                    enabled: Some(false),
                    ..FeedPatch::default()
                },
            )
            .await
            .unwrap();
        let (snap, _) = manager.snapshot().await;
        assert!(snap.is_empty());
        assert_eq!(
            manager.update("ghost", FeedPatch::default()).await,
            Err(FeedError::NotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn periodic_feed_refreshes_out_of_band() {
        let (manager, tool) = manager_with_tool(json!("tick"));
        let mut config = FeedConfig::new("p", FeedKind::Periodic);
        config.source = Some(FeedSource {
            adapter: Some(ActionKind::Tool),
            name: "src".into(),
            parameters: Value::Null,
        });
        config.interval_secs = Some(1);
        manager.add(config).await.unwrap();
        // The interval's first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tool.calls.load(Ordering::SeqCst) >= 1);
        let (snap, _) = manager.snapshot().await;
        assert_eq!(snap[0].1, "tick");
        manager.shutdown().await;
    }

    #[test]
    fn truncate_respects_token_heuristic() {
        let mut config = FeedConfig::new("f", FeedKind::OnDemand);
        config.max_tokens = Some(2);
        let (out, truncated) = truncate_feed("abcdefghij", &config);
        assert!(truncated);
        assert_eq!(out, "abcdefgh…");
        let (out, truncated) = truncate_feed("short", &config);
        assert!(!truncated);
        assert_eq!(out, "short");
    }

    #[tokio::test]
    async fn remove_unknown_feed_errors() {
        let (manager, _) = manager_with_tool(json!("v"));
        assert_eq!(
            manager.remove("nope").await,
            Err(FeedError::NotFound("nope".into()))
        );
    }
}

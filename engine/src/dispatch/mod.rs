//! Action dispatcher and per-iteration scheduler.
//!
//! The [`Dispatcher`] is session-scoped: adapter registry, parallelism
//! semaphore, the detached (fire-and-forget) task tracker and the
//! running-action table. Each iteration creates an [`IterationScheduler`]
//! holding the DAG; DAG updates run under its mutex, never across a
//! capability call. Completion handling runs in a dedicated loop task fed by
//! an unbounded channel, which also dispatches newly ready actions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use stream_event::SegmentEvent;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::action::{ActionDescriptor, ActionKind, ActionResult, ActionStatus};
use crate::capability::{AdapterRegistry, CapabilityError, CapabilityRequest};
use crate::dag::{DagError, DagResolver};
use crate::emitter::EventEmitter;
use crate::error::{SoftError, SoftErrorCode};
use crate::vars::{param_refs, substitute_params, VariableStore};

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(10);

/// Capability names the agent configuration declares, per kind. An absent
/// entry means the kind is unrestricted (nothing was declared).
#[derive(Clone, Debug, Default)]
pub struct DeclaredCapabilities {
    per_kind: HashMap<ActionKind, HashSet<String>>,
}

impl DeclaredCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the importable names for one kind. An empty list is treated
    /// as "no declaration" (unrestricted).
    pub fn declare(&mut self, kind: ActionKind, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.per_kind
            .insert(kind, names.iter().cloned().collect());
    }

    fn permits(&self, kind: ActionKind, name: &str) -> bool {
        match self.per_kind.get(&kind) {
            Some(names) => names.contains(name),
            None => true,
        }
    }
}

/// Session-scoped dispatch machinery.
pub struct Dispatcher {
    adapters: Arc<AdapterRegistry>,
    vars: Arc<VariableStore>,
    emitter: Arc<EventEmitter>,
    sem: Arc<Semaphore>,
    declared: DeclaredCapabilities,
    session_cancel: CancellationToken,
    detached: TaskTracker,
    running: DashMap<String, CancellationToken>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        vars: Arc<VariableStore>,
        emitter: Arc<EventEmitter>,
        declared: DeclaredCapabilities,
        session_cancel: CancellationToken,
        max_parallel: usize,
        default_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            vars,
            emitter,
            sem: Arc::new(Semaphore::new(max_parallel.max(1))),
            declared,
            session_cancel,
            detached: TaskTracker::new(),
            running: DashMap::new(),
            default_timeout: default_timeout.unwrap_or(DEFAULT_ACTION_TIMEOUT),
        })
    }

    /// Ids currently inside a capability call.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Runs one fire-and-forget action on the detached tracker. Not part of
    /// the iteration barrier; failures are logged, never cascaded.
    fn spawn_detached(self: &Arc<Self>, desc: ActionDescriptor) {
        let dispatcher = Arc::clone(self);
        self.detached.spawn(async move {
            let cancel = dispatcher.session_cancel.child_token();
            let result = dispatcher.execute(&desc, &cancel).await;
            if result.status != ActionStatus::Ok {
                tracing::warn!(
                    action = %desc.id,
                    status = result.status.as_str(),
                    "fire-and-forget action did not succeed: {}",
                    result.error.as_deref().unwrap_or("")
                );
            }
            dispatcher.emit_complete(&result).await;
        });
    }

    /// Waits up to `grace` for detached actions, then cancels the stragglers
    /// and waits for them to observe the token.
    pub async fn shutdown_detached(&self, grace: Duration) {
        self.detached.close();
        if tokio::time::timeout(grace, self.detached.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(
            in_flight = ?self.running_ids(),
            "detached actions exceeded the grace window; cancelling"
        );
        self.session_cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.detached.wait()).await;
    }

    async fn emit_complete(&self, result: &ActionResult) {
        self.emitter
            .emit(SegmentEvent::ActionComplete {
                id: result.id.clone(),
                status: result.status.as_str().to_string(),
                value: result.value.clone(),
                error: result.error.clone(),
                started_at: result.started_at.to_rfc3339(),
                ended_at: result.ended_at.to_rfc3339(),
            })
            .await;
    }

    /// Resolves parameters, invokes the adapter under timeout/retry, and
    /// returns the terminal result. Does not touch the DAG or the store.
    async fn execute(&self, desc: &ActionDescriptor, cancel: &CancellationToken) -> ActionResult {
        let started_at = chrono::Utc::now();
        self.running.insert(desc.id.clone(), cancel.clone());
        let outcome = self.execute_inner(desc, cancel).await;
        self.running.remove(&desc.id);
        let (status, value, error) = outcome;
        ActionResult {
            id: desc.id.clone(),
            status,
            value,
            error,
            started_at,
            ended_at: chrono::Utc::now(),
        }
    }

    async fn execute_inner(
        &self,
        desc: &ActionDescriptor,
        cancel: &CancellationToken,
    ) -> (ActionStatus, Option<Value>, Option<String>) {
        // Hold a semaphore permit for the whole capability call.
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                return (ActionStatus::Cancelled, None, Some("cancelled before start".into()));
            }
            p = self.sem.clone().acquire_owned() => p,
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => {
                return (
                    ActionStatus::Cancelled,
                    None,
                    Some("dispatcher shut down".into()),
                )
            }
        };

        if !self.declared.permits(desc.kind, &desc.name) {
            return (
                ActionStatus::Error,
                None,
                Some(format!(
                    "{} '{}' is not declared by this agent",
                    desc.kind.as_str(),
                    desc.name
                )),
            );
        }
        let Some(adapter) = self.adapters.get(desc.kind) else {
            return (
                ActionStatus::Error,
                None,
                Some(format!("no adapter registered for kind '{}'", desc.kind.as_str())),
            );
        };

        let (parameters, sub) = substitute_params(&desc.parameters, &|name| self.vars.get(name));
        for name in &sub.unresolved {
            self.emitter
                .report_soft(SoftError::new(
                    SoftErrorCode::UnresolvedVariable,
                    format!("action '{}' references unresolved ${name}", desc.id),
                ))
                .await;
        }

        let timeout = desc.timeout.unwrap_or(self.default_timeout);
        let attempts = desc.retry.saturating_add(1);
        let mut last_error: Option<CapabilityError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = RETRY_CAP.min(RETRY_BASE * 2u32.saturating_pow(attempt - 1));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return (ActionStatus::Cancelled, None, Some("cancelled during backoff".into()));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            let call_cancel = cancel.child_token();
            let invoke = adapter.invoke(CapabilityRequest {
                name: &desc.name,
                parameters: parameters.clone(),
                mode: desc.mode,
                cancel: &call_cancel,
            });
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    call_cancel.cancel();
                    return (ActionStatus::Cancelled, None, Some("cancelled".into()));
                }
                r = tokio::time::timeout(timeout, invoke) => r,
            };
            match result {
                Ok(Ok(value)) => return (ActionStatus::Ok, Some(value), None),
                Ok(Err(err)) => {
                    let retryable = err.transient && attempt + 1 < attempts;
                    tracing::debug!(
                        action = %desc.id,
                        attempt,
                        retryable,
                        "capability call failed: {err}"
                    );
                    if !retryable {
                        return (ActionStatus::Error, None, Some(err.message));
                    }
                    last_error = Some(err);
                }
                Err(_) => {
                    call_cancel.cancel();
                    return (
                        ActionStatus::Timeout,
                        None,
                        Some(format!("timed out after {}s", timeout.as_secs_f64())),
                    );
                }
            }
        }
        (
            ActionStatus::Error,
            None,
            last_error.map(|e| e.message),
        )
    }
}

struct SchedInner {
    dag: DagResolver,
    /// Descriptors inserted but not yet dispatched (blocked on predecessors).
    pending: HashMap<String, ActionDescriptor>,
    /// Output keys per tracked action, for failure propagation on cancel.
    output_keys: HashMap<String, String>,
    submitted: usize,
    finished: usize,
    completion_tx: Option<mpsc::UnboundedSender<(String, ActionStatus)>>,
}

/// Per-iteration scheduler: owns the DAG and the completion loop.
pub struct IterationScheduler {
    dispatcher: Arc<Dispatcher>,
    inner: StdMutex<SchedInner>,
    cancel: CancellationToken,
    /// Bumped on every completion; `drain` watches it (a watch channel cannot
    /// lose the wakeup between a counter check and the await).
    barrier: watch::Sender<usize>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl IterationScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, session_cancel: &CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            dispatcher,
            inner: StdMutex::new(SchedInner {
                dag: DagResolver::new(),
                pending: HashMap::new(),
                output_keys: HashMap::new(),
                submitted: 0,
                finished: 0,
                completion_tx: Some(tx),
            }),
            cancel: session_cancel.child_token(),
            barrier: watch::Sender::new(0),
            loop_handle: StdMutex::new(None),
        });
        let handle = tokio::spawn(Self::completion_loop(Arc::clone(&scheduler), rx));
        *scheduler
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        scheduler
    }

    /// Whether a tracked action in this iteration declares `key`. Used by the
    /// response buffer to decide between waiting and a soft error.
    pub fn produces_key(&self, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dag
            .has_producer(key)
    }

    /// Accepts one parsed descriptor. Fire-and-forget actions detach
    /// immediately; tracked actions enter the DAG and dispatch when ready.
    /// `Err` carries duplicate-id (soft) or cycle (iteration-fatal) failures.
    pub async fn submit(self: &Arc<Self>, desc: ActionDescriptor) -> Result<(), DagError> {
        if desc.mode.is_detached() {
            if let Some(key) = &desc.output_key {
                self.dispatcher
                    .emitter
                    .report_soft(SoftError::new(
                        SoftErrorCode::DetachedOutputKey,
                        format!(
                            "fire_and_forget action '{}' cannot bind output_key '{key}'",
                            desc.id
                        ),
                    ))
                    .await;
            }
            self.emit_start(&desc).await;
            self.dispatcher.spawn_detached(desc);
            return Ok(());
        }

        let implicit: Vec<String> = param_refs(&desc.parameters)
            .into_iter()
            .filter(|key| !self.dispatcher.vars.contains(key))
            .collect();
        let ready = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let ready = inner.dag.insert(&desc, &implicit)?;
            inner.submitted += 1;
            if let Some(key) = &desc.output_key {
                inner.output_keys.insert(desc.id.clone(), key.clone());
            }
            if !ready {
                inner.pending.insert(desc.id.clone(), desc.clone());
            }
            ready
        };
        self.emit_start(&desc).await;
        if ready {
            self.spawn_tracked(desc);
        }
        Ok(())
    }

    async fn emit_start(&self, desc: &ActionDescriptor) {
        self.dispatcher
            .emitter
            .emit(SegmentEvent::ActionStart {
                id: desc.id.clone(),
                kind: desc.kind.as_str().to_string(),
                mode: desc.mode.as_str().to_string(),
                name: desc.name.clone(),
            })
            .await;
    }

    fn spawn_tracked(self: &Arc<Self>, desc: ActionDescriptor) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = scheduler.cancel.child_token();
            let result = scheduler.dispatcher.execute(&desc, &cancel).await;
            // Complete frame first, then the store write: subscribers waking
            // on the write observe the frame already emitted.
            scheduler.dispatcher.emit_complete(&result).await;
            if let Some(key) = &desc.output_key {
                match (result.status, &result.value) {
                    (ActionStatus::Ok, Some(value)) => {
                        if let Err(e) = scheduler.dispatcher.vars.put(key, value.clone(), &desc.id)
                        {
                            scheduler
                                .dispatcher
                                .emitter
                                .report_soft(SoftError::new(
                                    SoftErrorCode::DuplicateOutputKey,
                                    e.to_string(),
                                ))
                                .await;
                        }
                    }
                    _ => {
                        scheduler.dispatcher.vars.fail(
                            key,
                            result
                                .error
                                .clone()
                                .unwrap_or_else(|| result.status.as_str().to_string()),
                        );
                    }
                }
            }
            let tx = scheduler
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .completion_tx
                .clone();
            if let Some(tx) = tx {
                let _ = tx.send((desc.id.clone(), result.status));
            }
        });
    }

    async fn completion_loop(
        scheduler: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(String, ActionStatus)>,
    ) {
        while let Some((id, status)) = rx.recv().await {
            let (cancelled, ready_descs) = {
                let mut inner = scheduler.inner.lock().unwrap_or_else(|e| e.into_inner());
                let effects = inner.dag.complete(&id, status);
                inner.finished += 1;
                let mut cancelled = Vec::new();
                for cid in &effects.cancelled {
                    inner.pending.remove(cid);
                    inner.finished += 1;
                    let key = inner.output_keys.get(cid).cloned();
                    cancelled.push((cid.clone(), key));
                }
                let ready_descs: Vec<ActionDescriptor> = effects
                    .ready
                    .iter()
                    .filter_map(|rid| inner.pending.remove(rid))
                    .collect();
                (cancelled, ready_descs)
            };
            for (cid, key) in cancelled {
                let now = chrono::Utc::now();
                scheduler
                    .dispatcher
                    .emit_complete(&ActionResult {
                        id: cid.clone(),
                        status: ActionStatus::Cancelled,
                        value: None,
                        error: Some(format!("cancelled: predecessor '{id}' failed")),
                        started_at: now,
                        ended_at: now,
                    })
                    .await;
                if let Some(key) = key {
                    scheduler
                        .dispatcher
                        .vars
                        .fail(&key, format!("producer cancelled after '{id}' failed"));
                }
            }
            let finished = scheduler
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .finished;
            scheduler.barrier.send_replace(finished);
            for desc in ready_descs {
                scheduler.spawn_tracked(desc);
            }
        }
    }

    fn is_settled(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.finished >= inner.submitted
    }

    /// Barrier: waits until every tracked action reached a terminal state,
    /// then stops the completion loop. Call after the LLM stream has ended
    /// (no further submits).
    pub async fn drain(self: &Arc<Self>) {
        let mut completions = self.barrier.subscribe();
        loop {
            if self.is_settled() {
                break;
            }
            if completions.changed().await.is_err() {
                break;
            }
        }
        // Defensive sweep: anything still blocked at this point never got a
        // completion path (should be unreachable).
        let leftover: Vec<String> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let ids = inner.dag.blocked_ids();
            for id in &ids {
                inner.dag.force_finish(id, ActionStatus::Cancelled);
                inner.pending.remove(id);
            }
            ids
        };
        for id in leftover {
            tracing::warn!(action = %id, "blocked action swept at iteration end");
            let now = chrono::Utc::now();
            self.dispatcher
                .emit_complete(&ActionResult {
                    id,
                    status: ActionStatus::Cancelled,
                    value: None,
                    error: Some("iteration ended before dependencies resolved".into()),
                    started_at: now,
                    ended_at: now,
                })
                .await;
        }
        let handle = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.completion_tx = None;
            self.loop_handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Cancels this iteration's tracked actions (user stop, session end).
    /// Detached actions are untouched; they answer to the session token.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

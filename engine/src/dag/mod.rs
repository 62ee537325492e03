//! Action dependency graph for one iteration.
//!
//! Nodes are tracked actions; edges mean "predecessor completes before
//! dependent runs". Edges come from explicit `depends_on` lists and from
//! implicit `$ref`s to another action's `output_key`. Because an edge may only
//! point at an already-inserted node, a reference to an id or key that has not
//! been declared yet is the forward-reference case and is rejected as a cycle.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::action::{ActionDescriptor, ActionStatus, OnErrorPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("duplicate action id '{0}'")]
    DuplicateId(String),
    #[error("dependency cycle: action '{id}' requires '{needs}', which is not declared before it")]
    Cycle { id: String, needs: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    /// Waiting on at least one predecessor.
    Blocked,
    /// Handed to the dispatcher.
    Dispatched,
    /// Terminal.
    Finished(ActionStatus),
}

struct Node {
    deps: HashSet<String>,
    dependents: Vec<String>,
    state: NodeState,
    on_error: OnErrorPolicy,
}

/// Effects of completing one node: which dependents became dispatchable and
/// which were cancelled by the default error policy.
#[derive(Debug, Default, PartialEq)]
pub struct CompletionEffects {
    pub ready: Vec<String>,
    pub cancelled: Vec<String>,
}

/// Per-iteration DAG state. All methods are synchronous; the scheduler holds
/// this behind a mutex around each update step.
#[derive(Default)]
pub struct DagResolver {
    nodes: HashMap<String, Node>,
    /// output_key -> producing action id, for implicit dependencies.
    key_producers: HashMap<String, String>,
    order: Vec<String>,
}

impl DagResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tracked action. `implicit_keys` are the `$ref` names in its
    /// parameters that are not already bound in the variable store; each must
    /// map to a previously declared producer. Returns whether the node is
    /// immediately dispatchable.
    pub fn insert(
        &mut self,
        desc: &ActionDescriptor,
        implicit_keys: &[String],
    ) -> Result<bool, DagError> {
        if self.nodes.contains_key(&desc.id) {
            return Err(DagError::DuplicateId(desc.id.clone()));
        }

        let mut deps: HashSet<String> = HashSet::new();
        for dep in &desc.depends_on {
            if !self.nodes.contains_key(dep) {
                return Err(DagError::Cycle {
                    id: desc.id.clone(),
                    needs: dep.clone(),
                });
            }
            deps.insert(dep.clone());
        }
        for key in implicit_keys {
            match self.key_producers.get(key) {
                Some(producer) => {
                    deps.insert(producer.clone());
                }
                None => {
                    return Err(DagError::Cycle {
                        id: desc.id.clone(),
                        needs: format!("${key}"),
                    })
                }
            }
        }

        for dep in &deps {
            if let Some(node) = self.nodes.get_mut(dep) {
                node.dependents.push(desc.id.clone());
            }
        }
        let ready = self.deps_satisfied(&deps, desc.on_error);
        self.nodes.insert(
            desc.id.clone(),
            Node {
                deps,
                dependents: Vec::new(),
                state: if ready {
                    NodeState::Dispatched
                } else {
                    NodeState::Blocked
                },
                on_error: desc.on_error,
            },
        );
        self.order.push(desc.id.clone());
        if let Some(key) = &desc.output_key {
            self.key_producers
                .entry(key.clone())
                .or_insert_with(|| desc.id.clone());
        }
        debug_assert!(!self.has_cycle(), "insertion order precludes cycles");
        Ok(ready)
    }

    fn deps_satisfied(&self, deps: &HashSet<String>, on_error: OnErrorPolicy) -> bool {
        deps.iter().all(|dep| match self.nodes.get(dep) {
            Some(node) => match node.state {
                NodeState::Finished(status) => {
                    status.is_ok() || on_error == OnErrorPolicy::Continue
                }
                _ => false,
            },
            None => false,
        })
    }

    /// Records a terminal state and computes follow-up work. A non-ok status
    /// transitively cancels blocked descendants that keep the default
    /// `on_error: cancel` policy.
    pub fn complete(&mut self, id: &str, status: ActionStatus) -> CompletionEffects {
        let mut effects = CompletionEffects::default();
        let Some(node) = self.nodes.get_mut(id) else {
            return effects;
        };
        node.state = NodeState::Finished(status);
        let dependents = node.dependents.clone();

        if status.is_ok() {
            for dep_id in dependents {
                self.try_promote(&dep_id, &mut effects);
            }
        } else {
            let mut stack = dependents;
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(dep_id) = stack.pop() {
                if !seen.insert(dep_id.clone()) {
                    continue;
                }
                let (blocked, survives) = match self.nodes.get(&dep_id) {
                    Some(d) => (
                        d.state == NodeState::Blocked,
                        d.on_error == OnErrorPolicy::Continue,
                    ),
                    None => continue,
                };
                if !blocked {
                    continue;
                }
                if survives {
                    self.try_promote(&dep_id, &mut effects);
                    continue;
                }
                let grand = match self.nodes.get_mut(&dep_id) {
                    Some(dep) => {
                        dep.state = NodeState::Finished(ActionStatus::Cancelled);
                        dep.dependents.clone()
                    }
                    None => continue,
                };
                effects.cancelled.push(dep_id);
                stack.extend(grand);
            }
        }
        effects
    }

    fn try_promote(&mut self, id: &str, effects: &mut CompletionEffects) {
        let (deps, on_error, blocked) = match self.nodes.get(id) {
            Some(n) => (n.deps.clone(), n.on_error, n.state == NodeState::Blocked),
            None => return,
        };
        if !blocked {
            return;
        }
        if self.deps_satisfied(&deps, on_error) {
            if let Some(node) = self.nodes.get_mut(id) {
                node.state = NodeState::Dispatched;
            }
            effects.ready.push(id.to_string());
        }
    }

    /// Ids still blocked (used to sweep cancellations at iteration teardown).
    pub fn blocked_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map(|n| n.state == NodeState::Blocked)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Marks a node terminal without follow-up computation (teardown sweep).
    pub fn force_finish(&mut self, id: &str, status: ActionStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Finished(status);
        }
    }

    pub fn is_finished(&self, id: &str) -> bool {
        matches!(
            self.nodes.get(id).map(|n| n.state),
            Some(NodeState::Finished(_))
        )
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Whether some tracked action in this iteration declares `key` as its
    /// output. Drives response-buffer decisions for not-yet-bound refs.
    pub fn has_producer(&self, key: &str) -> bool {
        self.key_producers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Defensive full-graph cycle check (DFS). Insertion order makes a cycle
    /// impossible, so this backs a debug assertion rather than the hot path.
    fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        fn visit<'a>(
            id: &'a str,
            nodes: &'a HashMap<String, Node>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(id) {
                Some(Mark::Done) => return false,
                Some(Mark::Visiting) => return true,
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(node) = nodes.get(id) {
                for dep in &node.deps {
                    if visit(dep, nodes, marks) {
                        return true;
                    }
                }
            }
            marks.insert(id, Mark::Done);
            false
        }
        self.nodes.keys().any(|id| visit(id, &self.nodes, &mut marks))
    }
}

//! The Graph Engine: drives one run's execution from its entry node to
//! completion, an interrupt, or a fatal error.
//!
//! A run's frontier is a single "current node" except while a
//! `Command::Send` fan-out is in flight, so there is no need for
//! version-gated supersteps here: fan-out dispatch is its own bounded
//! concurrency block (`dispatch_fanout`), keyed on each child's own
//! `NodeKind` rather than the parent's, so N parallel invocations of the
//! same node (e.g. `grade_question` dispatched once per region) run
//! independently instead of collapsing into one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::control::{Command, SendTarget};
use crate::event_bus::EventEmitter;
use crate::graph_state::GraphState;
use crate::node::{Node, NodeContext, NodeError};
use crate::types::NodeKind;

/// Routing predicate evaluated against the state produced by a node's
/// `Command::Update`, picking the next node to run. Generalizes the
/// source's `EdgePredicate` to a typed state rather than an untyped
/// snapshot.
pub type EdgePredicate<S> = Arc<dyn Fn(&S) -> NodeKind + Send + Sync>;

/// Builds the fan-out dispatch list from state as it stands right after a
/// node's `Command::Update` merge — used by [`Edge::FanOut`] so a node can
/// write its own bookkeeping (e.g. `segment` writing `regions`) via a plain
/// `Update` and still trigger fan-out, rather than losing that update by
/// returning `Command::Send` directly (see [`Command::Send`] for the case
/// where a node legitimately has no bookkeeping of its own to merge first).
pub type FanOutBuilder<S> = Arc<dyn Fn(&S) -> Vec<SendTarget> + Send + Sync>;

/// What follows a node's plain `Command::Update` completion.
#[derive(Clone)]
pub enum Edge<S: GraphState> {
    /// Always proceed to the same node.
    Static(NodeKind),
    /// Proceed to whichever node the predicate names, evaluated against
    /// the state as it stands right after the merge.
    Conditional(EdgePredicate<S>),
    /// Dispatch fan-out children built from the post-merge state, then
    /// proceed to `join` once every child's result has been folded back in.
    FanOut { build_targets: FanOutBuilder<S>, join: NodeKind },
}

/// A compiled graph: its node bodies, the static/conditional/fan-out edge
/// for each node's plain completion, the join node for nodes that fan out
/// directly via `Command::Send` (as opposed to an `Edge::FanOut`), and the
/// entry point.
pub struct GraphDef<S: GraphState> {
    pub name: crate::types::GraphName,
    pub nodes: FxHashMap<NodeKind, Arc<dyn Node<S>>>,
    pub edges: FxHashMap<NodeKind, Edge<S>>,
    pub fanout_join: FxHashMap<NodeKind, NodeKind>,
    pub entry: NodeKind,
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("node '{node}' failed: {source}")]
    #[diagnostic(code(examflow::engine::node_run))]
    NodeRun { node: NodeKind, #[source] source: NodeError },

    #[error("node '{node}' is not part of this graph")]
    #[diagnostic(code(examflow::engine::unknown_node))]
    UnknownNode { node: NodeKind },

    #[error("fan-out child of '{node}' returned a non-Update command; children must report results, not route")]
    #[diagnostic(code(examflow::engine::child_must_update))]
    ChildMustUpdate { node: NodeKind },

    #[error("node '{node}' has no outgoing edge and did not reach End")]
    #[diagnostic(code(examflow::engine::dangling_node))]
    DanglingNode { node: NodeKind },

    #[error("node '{node}' issued a fan-out Send but the graph defines no join node for it")]
    #[diagnostic(code(examflow::engine::missing_fanout_join))]
    MissingFanoutJoin { node: NodeKind },
}

/// How a run's execution ended.
#[derive(Debug)]
pub enum EngineStatus {
    /// Reached `End`.
    Completed,
    /// A node returned `Command::Interrupt`; `at` identifies the node to
    /// re-invoke (with the resume payload attached) when the run resumes.
    Interrupted { at: NodeKind, payload: serde_json::Value },
    /// `cancel_requested` was observed before the next node was dispatched
    /// (§4.1/§5); the run stops where it stands rather than reaching `End`.
    Cancelled,
}

/// The result of driving a run until it completes, suspends, or the caller
/// wants to checkpoint and yield (see [`Engine::step`]).
pub struct EngineOutcome<S: GraphState> {
    pub state: S,
    pub status: EngineStatus,
}

/// Drives one [`GraphDef`] to completion or suspension. Stateless itself —
/// all mutable state lives in the `S` value threaded through `run`.
pub struct Engine<S: GraphState> {
    graph: Arc<GraphDef<S>>,
    fanout_concurrency_cap: usize,
    default_node_timeout: Duration,
    node_timeouts: FxHashMap<NodeKind, Duration>,
}

impl<S: GraphState> Engine<S> {
    #[must_use]
    pub fn new(graph: Arc<GraphDef<S>>, fanout_concurrency_cap: usize, default_node_timeout: Duration) -> Self {
        Self {
            graph,
            fanout_concurrency_cap,
            default_node_timeout,
            node_timeouts: FxHashMap::default(),
        }
    }

    /// Overrides the wall-clock budget for one node (e.g. `segment`'s
    /// longer-than-default timeout), falling back to
    /// `default_node_timeout` for every other node.
    #[must_use]
    pub fn with_node_timeout(mut self, node: NodeKind, timeout: Duration) -> Self {
        self.node_timeouts.insert(node, timeout);
        self
    }

    fn timeout_for(&self, node: &NodeKind) -> Duration {
        self.node_timeouts.get(node).copied().unwrap_or(self.default_node_timeout)
    }

    /// This graph's entry node, for a worker starting a fresh run.
    #[must_use]
    pub fn entry(&self) -> NodeKind {
        self.graph.entry.clone()
    }

    /// This graph's catalog name, for a worker registering engines by
    /// [`crate::types::GraphName`].
    #[must_use]
    pub fn name(&self) -> crate::types::GraphName {
        self.graph.name
    }

    /// Runs from `start` (the graph's entry node on a fresh run, or a
    /// previously interrupted node on resume) until `End`, an interrupt, or
    /// a fatal node error.
    ///
    /// `resume_payload` is threaded into the very first node invocation
    /// only (the resumption of whatever node returned `Interrupt`); every
    /// subsequent node in this call sees `None`.
    pub async fn run(
        &self,
        mut state: S,
        start: NodeKind,
        mut resume_payload: Option<serde_json::Value>,
        mut step: u64,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<EngineOutcome<S>, EngineError> {
        let mut current = start;

        loop {
            if current.is_end() {
                return Ok(EngineOutcome { state, status: EngineStatus::Completed });
            }

            if state.is_cancel_requested() {
                return Ok(EngineOutcome { state, status: EngineStatus::Cancelled });
            }

            let node = self
                .graph
                .nodes
                .get(&current)
                .cloned()
                .ok_or_else(|| EngineError::UnknownNode { node: current.clone() })?;

            let ctx = NodeContext {
                node_id: current.encode(),
                step,
                event_emitter: emitter.clone(),
                resume_payload: resume_payload.take(),
                send_input: None,
            };

            let timeout = self.timeout_for(&current);
            let started = Instant::now();
            let command = match tokio::time::timeout(timeout, node.run(state.clone(), ctx)).await {
                Ok(Ok(command)) => command,
                Ok(Err(source)) => return Err(EngineError::NodeRun { node: current.clone(), source }),
                Err(_) => {
                    return Err(EngineError::NodeRun {
                        node: current.clone(),
                        source: NodeError::Timeout {
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            budget_ms: timeout.as_millis() as u64,
                        },
                    });
                }
            };
            step += 1;

            match command {
                Command::Update(partial) => {
                    state.merge(partial);
                    current = match self.graph.edges.get(&current) {
                        Some(Edge::Static(next)) => next.clone(),
                        Some(Edge::Conditional(predicate)) => predicate(&state),
                        Some(Edge::FanOut { build_targets, join }) => {
                            let targets = build_targets(&state);
                            let join = join.clone();
                            self.dispatch_fanout(&current, targets, &mut state, step, emitter.clone())
                                .await?;
                            join
                        }
                        None => return Err(EngineError::DanglingNode { node: current.clone() }),
                    };
                }
                Command::Goto(next) => {
                    current = next;
                }
                Command::Interrupt(payload) => {
                    return Ok(EngineOutcome {
                        state,
                        status: EngineStatus::Interrupted { at: current, payload },
                    });
                }
                Command::Send(targets) => {
                    let join = self
                        .graph
                        .fanout_join
                        .get(&current)
                        .cloned()
                        .ok_or_else(|| EngineError::MissingFanoutJoin { node: current.clone() })?;
                    self.dispatch_fanout(&current, targets, &mut state, step, emitter.clone())
                        .await?;
                    current = join;
                }
            }
        }
    }

    async fn dispatch_fanout(
        &self,
        from: &NodeKind,
        targets: Vec<SendTarget>,
        state: &mut S,
        step: u64,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<(), EngineError> {
        if state.is_cancel_requested() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.fanout_concurrency_cap.max(1)));
        let mut futures = FuturesUnordered::new();

        for target in targets {
            let node = self
                .graph
                .nodes
                .get(&target.node)
                .cloned()
                .ok_or_else(|| EngineError::UnknownNode { node: target.node.clone() })?;
            let snapshot = state.clone();
            let semaphore = semaphore.clone();
            let emitter = emitter.clone();
            let node_kind = target.node.clone();
            let input = target.input;
            let timeout = self.timeout_for(&node_kind);

            futures.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("fan-out semaphore is never closed");
                let ctx = NodeContext {
                    node_id: node_kind.encode(),
                    step,
                    event_emitter: emitter,
                    resume_payload: None,
                    send_input: Some(input),
                };
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, node.run(snapshot, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        budget_ms: timeout.as_millis() as u64,
                    }),
                };
                (node_kind, result)
            });
        }

        let mut partials = Vec::new();
        while let Some((node_kind, result)) = futures.next().await {
            match result.map_err(|source| EngineError::NodeRun { node: node_kind.clone(), source })? {
                Command::Update(partial) => partials.push(partial),
                _ => return Err(EngineError::ChildMustUpdate { node: from.clone() }),
            }
        }

        for partial in partials {
            state.merge(partial);
        }
        Ok(())
    }
}

//! The command vocabulary a node returns to the engine.
//!
//! Nodes do not mutate state or the frontier directly; they return a
//! [`Command`] and the engine interprets it. This keeps routing intent
//! separate from state updates the same way the upstream frontier-command
//! design did, generalized to cover fan-out and suspension as well as
//! imperative jumps.

use serde::{Deserialize, Serialize};

use crate::types::NodeKind;

/// One child dispatch created by a [`Command::Send`].
///
/// `input` is an opaque, serializable derived sub-state for the child
/// invocation of `node` — for example a single `QuestionRegion` plus the
/// run's rubric, rather than the full parent state. The child node is
/// responsible for interpreting its own `input` shape; the engine only
/// threads it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTarget {
    pub node: NodeKind,
    pub input: serde_json::Value,
}

impl SendTarget {
    pub fn new(node: impl Into<NodeKind>, input: serde_json::Value) -> Self {
        Self {
            node: node.into(),
            input,
        }
    }
}

/// What a node asks the engine to do next.
///
/// `Partial` is the graph-specific state-update type produced by a normal
/// completion (see [`crate::graph_state::GraphState`]); the other three
/// variants are the control-flow values the specification calls `Send`,
/// `Interrupt`, and `Goto`.
#[derive(Debug, Clone)]
pub enum Command<Partial> {
    /// Merge `Partial` into state via each channel's reducer and continue
    /// along the node's outgoing edges.
    Update(Partial),
    /// Fan out: schedule one concurrent child invocation per entry, up to
    /// the run's fan-out concurrency cap. Children's own `Update` results
    /// are merged back into the parent state through the declared reducer
    /// of whichever channel they write.
    Send(Vec<SendTarget>),
    /// Suspend the run at this node. `payload` is persisted verbatim in
    /// the next checkpoint; resumption re-invokes the same node with the
    /// resume payload attached by `SendEvent` exposed to it.
    Interrupt(serde_json::Value),
    /// Jump to `node`, overriding the node's static/conditional edges.
    Goto(NodeKind),
}

impl<Partial> Command<Partial> {
    pub fn update(partial: Partial) -> Self {
        Command::Update(partial)
    }

    pub fn send(targets: Vec<SendTarget>) -> Self {
        Command::Send(targets)
    }

    pub fn interrupt(payload: serde_json::Value) -> Self {
        Command::Interrupt(payload)
    }

    pub fn goto(node: impl Into<NodeKind>) -> Self {
        Command::Goto(node.into())
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Command::Interrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_target_carries_opaque_input() {
        let t = SendTarget::new(NodeKind::Custom("grade_question".into()), serde_json::json!({"question_id": "q1"}));
        assert_eq!(t.node, NodeKind::Custom("grade_question".into()));
        assert_eq!(t.input["question_id"], "q1");
    }

    #[test]
    fn is_interrupt_detects_variant() {
        let cmd: Command<()> = Command::interrupt(serde_json::json!({"needs_review": true}));
        assert!(cmd.is_interrupt());
        assert!(!Command::update(()).is_interrupt());
    }
}

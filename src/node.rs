//! Node execution framework.
//!
//! A [`Node`] is the atomic unit of graph computation: an async function
//! from a state snapshot to a [`Command`]. Nodes are generic over the
//! concrete [`GraphState`] of the graph they belong to, so the same trait
//! serves the ExamPaper, BatchGrading, and RuleUpgrade catalogs without a
//! shared untyped state representation.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::control::Command;
use crate::event_bus::{Event, EventEmitter};
use crate::graph_state::GraphState;
use std::sync::Arc;

/// Executable unit of graph computation.
///
/// # Error Handling
///
/// A node has two ways to signal trouble:
/// 1. **Fatal**: return `Err(NodeError)`. The retry wrapper (see
///    [`crate::retry`]) classifies it as retryable or not; if retries are
///    exhausted (or the error is non-retryable), the wrapper — not the
///    node — produces the degraded result and appends an error record.
/// 2. **Recoverable**: return `Ok(Command::Update(partial))` where the
///    partial itself carries an error record in its core channels.
#[async_trait]
pub trait Node<S: GraphState>: Send + Sync {
    async fn run(&self, snapshot: S, ctx: NodeContext) -> Result<Command<S::Partial>, NodeError>;
}

/// Execution context passed to a node invocation.
///
/// `resume_payload` is `Some` only when this invocation is the resumption
/// of a node that previously returned `Command::Interrupt` — the value is
/// exactly what `SendEvent` attached to the run's `resume_payload`.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub step: u64,
    pub event_emitter: Arc<dyn EventEmitter>,
    pub resume_payload: Option<serde_json::Value>,
    /// Set only for a `Command::Send` child invocation: the `input` value
    /// from its [`crate::control::SendTarget`]. `None` for every node
    /// invoked off the main frontier.
    pub send_input: Option<serde_json::Value>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("step", &self.step)
            .field("resume_payload", &self.resume_payload)
            .field("send_input", &self.send_input)
            .finish()
    }
}

impl NodeContext {
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.event_emitter
            .emit(Event::node_message_with_meta(
                self.node_id.clone(),
                self.step,
                scope,
                message,
            ))
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }

    pub fn emit_diagnostic(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.event_emitter
            .emit(Event::diagnostic(scope, message))
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum NodeContextError {
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(
        code(examflow::node::event_bus_unavailable),
        help("The event bus may be disconnected or at capacity.")
    )]
    EventBusUnavailable,
}

/// Errors a node body can fail with. Every variant is classified by
/// [`NodeError::is_retryable`] so the retry wrapper (§4.2 of the
/// specification) can decide between another attempt and a non-retryable
/// bail-out without matching on a string.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input missing from the snapshot or the `Send` sub-state.
    /// Not retryable — another attempt would see the same missing input.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(examflow::node::missing_input),
        help("Check that the dispatching node produced the required input: {what}.")
    )]
    MissingInput { what: &'static str },

    /// A collaborator call exceeded its wall-clock budget. Retryable.
    #[error("node timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    #[diagnostic(code(examflow::node::timeout))]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    /// Transient network failure talking to an external collaborator.
    /// Retryable.
    #[error("transient error calling {provider}: {message}")]
    #[diagnostic(code(examflow::node::transient))]
    Transient {
        provider: &'static str,
        message: String,
    },

    /// The collaborator's rate limiter refused the call after blocking up
    /// to its bounded wait. Retryable.
    #[error("rate limited by {provider}")]
    #[diagnostic(
        code(examflow::node::rate_limited),
        help("The process-global rate limiter is saturated; this will be retried with backoff.")
    )]
    RateLimited { provider: &'static str },

    /// A collaborator responded but the response violated the expected
    /// schema. Not retryable — the response will not change on retry.
    #[error("schema violation from {provider}: {message}")]
    #[diagnostic(code(examflow::node::schema_violation))]
    SchemaViolation {
        provider: &'static str,
        message: String,
    },

    /// Parameter validation failed before any external call was made. Not
    /// retryable.
    #[error("validation failed: {0}")]
    #[diagnostic(code(examflow::node::validation))]
    ValidationFailed(String),

    #[error(transparent)]
    #[diagnostic(code(examflow::node::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("event bus error: {0}")]
    #[diagnostic(code(examflow::node::event_bus))]
    EventBus(#[from] NodeContextError),
}

impl NodeError {
    /// Classifies this error for the retry wrapper: `true` means another
    /// attempt is worth making, `false` means the wrapper should bail
    /// straight to the degraded result without spending remaining
    /// attempts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout { .. } | NodeError::Transient { .. } | NodeError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_specification() {
        assert!(NodeError::Timeout { elapsed_ms: 1, budget_ms: 1 }.is_retryable());
        assert!(
            NodeError::Transient {
                provider: "grader",
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(NodeError::RateLimited { provider: "grader" }.is_retryable());
        assert!(!NodeError::ValidationFailed("bad".into()).is_retryable());
        assert!(
            !NodeError::SchemaViolation {
                provider: "grader",
                message: "missing field".into()
            }
            .is_retryable()
        );
        assert!(!NodeError::MissingInput { what: "region" }.is_retryable());
    }
}

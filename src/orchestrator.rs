//! The Orchestrator façade (§4.4/§6): the public surface client code talks
//! to. A thin wrapper over [`StateStore`] — it owns the validation and
//! status-transition rules (idempotent `StartRun`, `SendEvent` only while
//! `PAUSED`, `Retry` only while `FAILED`) that the trait itself leaves to
//! its callers. The Worker Pool is the only other caller of `StateStore`;
//! it never goes through this type.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::ids::RunId;
use crate::runtimes::{RunFilter, RunRecord, StateStore, StateStoreError};
use crate::types::{GraphName, RunStatus};

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    /// `StartRun` with a payload that isn't a JSON object.
    #[error("input payload must be a JSON object")]
    #[diagnostic(
        code(examflow::orchestrator::invalid_payload),
        help("Wrap the run's input fields in a JSON object, e.g. {{\"exam_id\": \"...\"}}.")
    )]
    InvalidPayload,

    /// `SendEvent` against a run that is not currently `PAUSED`.
    #[error("run {run_id} is not PAUSED")]
    #[diagnostic(
        code(examflow::orchestrator::not_paused),
        help("SendEvent only applies to a run suspended at an interrupt; check GetStatus first.")
    )]
    NotPaused { run_id: RunId },

    /// `Retry` against a run that is not currently `FAILED`.
    #[error("run {run_id} is not FAILED")]
    #[diagnostic(
        code(examflow::orchestrator::not_failed),
        help("Retry only applies to a run that exhausted its attempts and reached FAILED.")
    )]
    NotFailed { run_id: RunId },

    /// `StartRun` with an `idempotency_key` already bound to a different
    /// `input_payload`.
    #[error("idempotency key {key} is already bound to a different run")]
    #[diagnostic(
        code(examflow::orchestrator::idempotency_conflict),
        help("Use a new idempotency_key, or call StartRun with the original payload to fetch the existing run.")
    )]
    IdempotencyConflict { key: String },

    #[error(transparent)]
    #[diagnostic(code(examflow::orchestrator::store))]
    Store(#[from] StateStoreError),
}

/// `StartRun`/`GetStatus`/`ListRuns`/`Cancel`/`Retry`/`SendEvent` (§4.4),
/// written against the [`StateStore`] trait so it never depends on a
/// specific backend.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Starts a new run, or returns the existing run unchanged if
    /// `idempotency_key` was already bound to one with the same payload
    /// (§4.4 `StartRun`). Same key, different payload surfaces
    /// `IdempotencyConflict`.
    pub async fn start_run(
        &self,
        graph_name: GraphName,
        input_payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<RunRecord, OrchestratorError> {
        if !input_payload.is_object() {
            return Err(OrchestratorError::InvalidPayload);
        }
        match self.store.start_run(graph_name, input_payload, idempotency_key).await {
            Err(StateStoreError::IdempotencyConflict { key }) => Err(OrchestratorError::IdempotencyConflict { key }),
            other => Ok(other?),
        }
    }

    pub async fn get_status(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>, OrchestratorError> {
        Ok(self.store.list_runs(filter).await?)
    }

    /// Requests cancellation; terminal immediately if the run is `PENDING`
    /// or `PAUSED`, otherwise cooperative (the engine checks
    /// `cancel_requested` before its next node and before each fan-out
    /// child, then winds the run down to `CANCELLED` without reaching
    /// `End`). Returns `false` if the run was already terminal.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, OrchestratorError> {
        Ok(self.store.cancel_run(run_id).await?)
    }

    /// Creates a new run carrying the same `graph_name` and `input_payload`
    /// as a `FAILED` run (§4.4/§6 `Retry`). The original run is left
    /// `FAILED` — this is a fresh attempt, not a resume.
    pub async fn retry(&self, run_id: RunId) -> Result<RunId, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Err(OrchestratorError::NotFailed { run_id });
        }
        let new_run = self.store.start_run(run.graph_name, run.input_payload, None).await?;
        Ok(new_run.run_id)
    }

    /// Delivers a resume payload to a `PAUSED` run and flips it back to
    /// `PENDING` for a worker to pick up.
    pub async fn send_event(
        &self,
        run_id: RunId,
        resume_payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let delivered = self.store.send_event(run_id, resume_payload).await?;
        if !delivered {
            return Err(OrchestratorError::NotPaused { run_id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtimes::InMemoryStateStore;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(InMemoryStateStore::new()))
    }

    #[tokio::test]
    async fn start_run_rejects_non_object_payload() {
        let orch = orchestrator();
        let err = orch
            .start_run(GraphName::ExamPaper, serde_json::json!("not an object"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPayload));
    }

    #[tokio::test]
    async fn start_run_is_idempotent_on_key_with_same_payload() {
        let orch = orchestrator();
        let a = orch
            .start_run(GraphName::ExamPaper, serde_json::json!({"x": 1}), Some("k".into()))
            .await
            .unwrap();
        let b = orch
            .start_run(GraphName::ExamPaper, serde_json::json!({"x": 1}), Some("k".into()))
            .await
            .unwrap();
        assert_eq!(a.run_id, b.run_id);
    }

    #[tokio::test]
    async fn start_run_with_same_key_and_different_payload_is_a_conflict() {
        let orch = orchestrator();
        orch.start_run(GraphName::ExamPaper, serde_json::json!({}), Some("k".into())).await.unwrap();
        let err = orch
            .start_run(GraphName::ExamPaper, serde_json::json!({"x": 1}), Some("k".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IdempotencyConflict { key } if key == "k"));
    }

    #[tokio::test]
    async fn retry_requires_failed_status() {
        let orch = orchestrator();
        let run = orch.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        let err = orch.retry(run.run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFailed { .. }));
    }

    #[tokio::test]
    async fn retry_creates_a_new_run_and_leaves_the_old_one_failed() {
        let orch = orchestrator();
        let run = orch
            .start_run(GraphName::ExamPaper, serde_json::json!({"exam_id": "e1"}), None)
            .await
            .unwrap();
        orch.store.fail_run(run.run_id, "boom".into()).await.unwrap();

        let new_run_id = orch.retry(run.run_id).await.unwrap();
        assert_ne!(new_run_id, run.run_id);

        let old = orch.get_status(run.run_id).await.unwrap();
        assert_eq!(old.status, RunStatus::Failed);

        let fresh = orch.get_status(new_run_id).await.unwrap();
        assert_eq!(fresh.status, RunStatus::Pending);
        assert_eq!(fresh.graph_name, run.graph_name);
        assert_eq!(fresh.input_payload, run.input_payload);
    }

    #[tokio::test]
    async fn send_event_requires_paused_status() {
        let orch = orchestrator();
        let run = orch.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        let err = orch.send_event(run.run_id, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotPaused { .. }));
    }

    #[tokio::test]
    async fn cancel_pending_run_reports_true_once() {
        let orch = orchestrator();
        let run = orch.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        assert!(orch.cancel(run.run_id).await.unwrap());
        assert!(!orch.cancel(run.run_id).await.unwrap());
    }
}

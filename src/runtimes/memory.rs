//! Volatile [`StateStore`] backend: an in-process map guarded by a single
//! mutex. Used by the crate's own tests and by local development that
//! doesn't need durability across process restarts.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::ids::{AttemptId, CheckpointId, RunId};
use crate::types::{GraphName, RunStatus};

use super::store::{
    AttemptRecord, CheckpointRecord, ClaimedRun, RunFilter, RunRecord, StateStore, StateStoreError,
    payload_fingerprint,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, RunRecord>,
    idempotency_index: HashMap<String, RunId>,
    attempts: HashMap<RunId, Vec<AttemptRecord>>,
    checkpoints: HashMap<RunId, Vec<CheckpointRecord>>,
}

/// `parking_lot::Mutex`-guarded, matching the rest of the crate's leaf
/// services (the semantic cache, the rate limiter) rather than reaching for
/// an async-aware lock: every critical section here is synchronous map
/// manipulation with no `.await` inside it.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn start_run(
        &self,
        graph_name: GraphName,
        input_payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<RunRecord, StateStoreError> {
        let mut inner = self.inner.lock();
        if let Some(key) = &idempotency_key
            && let Some(existing) = inner.idempotency_index.get(key)
        {
            let existing = inner.runs[existing].clone();
            if payload_fingerprint(&existing.input_payload) != payload_fingerprint(&input_payload) {
                return Err(StateStoreError::IdempotencyConflict { key: key.clone() });
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let run = RunRecord {
            run_id: RunId::new(),
            graph_name,
            status: RunStatus::Pending,
            input_payload,
            output_payload: None,
            idempotency_key: idempotency_key.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            resume_payload: None,
            cancel_requested: false,
            claimed_by: None,
            claimed_until: None,
        };
        inner.runs.insert(run.run_id, run.clone());
        if let Some(key) = idempotency_key {
            inner.idempotency_index.insert(key, run.run_id);
        }
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StateStoreError> {
        self.inner
            .lock()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StateStoreError::NotFound { run_id })
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>, StateStoreError> {
        let inner = self.inner.lock();
        let mut matches: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|r| filter.graph_name.is_none_or(|g| g == r.graph_name))
            .filter(|r| filter.status.is_none_or(|s| s == r.status))
            .filter(|r| filter.created_after.is_none_or(|t| r.created_at >= t))
            .filter(|r| filter.created_before.is_none_or(|t| r.created_at <= t))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.created_at);
        let start = (filter.offset as usize).min(matches.len());
        let end = (start + filter.limit.max(1) as usize).min(matches.len());
        Ok(matches[start..end].to_vec())
    }

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<CheckpointRecord>, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(&run_id)
            .and_then(|cps| cps.last().cloned()))
    }

    async fn claim_pending_run(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedRun>, StateStoreError> {
        let mut inner = self.inner.lock();
        let Some(run_id) = inner
            .runs
            .values()
            .find(|r| r.status == RunStatus::Pending)
            .map(|r| r.run_id)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let attempt_number = inner.attempts.get(&run_id).map_or(0, |a| a.len() as u32) + 1;
        let attempt = AttemptRecord {
            attempt_id: AttemptId::new(),
            run_id,
            attempt_number,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            error: None,
        };
        inner.attempts.entry(run_id).or_default().push(attempt.clone());

        let run = inner.runs.get_mut(&run_id).expect("just looked up by run_id");
        run.status = RunStatus::Running;
        run.claimed_by = Some(worker_id.to_string());
        run.claimed_until = Some(now + lease);
        run.updated_at = now;
        let run = run.clone();

        let checkpoint = inner.checkpoints.get(&run_id).and_then(|cps| cps.last().cloned());
        Ok(Some(ClaimedRun { run, attempt, checkpoint }))
    }

    async fn renew_lease(&self, run_id: RunId, worker_id: &str, lease: Duration) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        if run.claimed_by.as_deref() == Some(worker_id) {
            run.claimed_until = Some(Utc::now() + lease);
        }
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        run_id: RunId,
        parent: Option<CheckpointId>,
        state_snapshot: serde_json::Value,
        next_node: String,
        metadata: serde_json::Value,
    ) -> Result<CheckpointRecord, StateStoreError> {
        let mut inner = self.inner.lock();
        if !inner.runs.contains_key(&run_id) {
            return Err(StateStoreError::NotFound { run_id });
        }
        let checkpoint = CheckpointRecord {
            checkpoint_id: CheckpointId::new(),
            run_id,
            parent_checkpoint_id: parent,
            state_snapshot,
            next_node,
            metadata,
            created_at: Utc::now(),
        };
        inner.checkpoints.entry(run_id).or_default().push(checkpoint.clone());
        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.updated_at = checkpoint.created_at;
        }
        Ok(checkpoint)
    }

    async fn complete_run(&self, run_id: RunId, output_payload: serde_json::Value) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        run.status = RunStatus::Completed;
        run.output_payload = Some(output_payload);
        run.completed_at = Some(now);
        run.updated_at = now;
        run.claimed_by = None;
        run.claimed_until = None;
        Ok(())
    }

    async fn cancel_run_terminal(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(now);
        run.updated_at = now;
        run.claimed_by = None;
        run.claimed_until = None;
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, error: String) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        run.status = RunStatus::Failed;
        run.error = Some(error);
        run.completed_at = Some(now);
        run.updated_at = now;
        run.claimed_by = None;
        run.claimed_until = None;
        Ok(())
    }

    async fn pause_run(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        run.status = RunStatus::Paused;
        run.updated_at = now;
        run.claimed_by = None;
        run.claimed_until = None;
        Ok(())
    }

    async fn release_to_pending(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        if !run.status.is_terminal() {
            run.status = RunStatus::Pending;
            run.claimed_by = None;
            run.claimed_until = None;
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<bool, StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.cancel_requested = true;
        if matches!(run.status, RunStatus::Pending | RunStatus::Paused) {
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(now);
        }
        run.updated_at = now;
        Ok(true)
    }

    async fn send_event(
        &self,
        run_id: RunId,
        resume_payload: serde_json::Value,
    ) -> Result<bool, StateStoreError> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(StateStoreError::NotFound { run_id })?;
        if run.status != RunStatus::Paused {
            return Ok(false);
        }
        run.resume_payload = Some(resume_payload);
        run.status = RunStatus::Pending;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn sweep_expired_leases(&self) -> Result<Vec<RunId>, StateStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expired: Vec<RunId> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.claimed_until.is_some_and(|until| until < now))
            .map(|r| r.run_id)
            .collect();
        for run_id in &expired {
            if let Some(run) = inner.runs.get_mut(run_id) {
                run.status = RunStatus::Pending;
                run.claimed_by = None;
                run.claimed_until = None;
                run.updated_at = now;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_run_with_same_idempotency_key_and_payload_returns_same_run() {
        let store = InMemoryStateStore::new();
        let a = store
            .start_run(GraphName::ExamPaper, serde_json::json!({"x": 1}), Some("key-1".into()))
            .await
            .unwrap();
        let b = store
            .start_run(GraphName::ExamPaper, serde_json::json!({"x": 1}), Some("key-1".into()))
            .await
            .unwrap();
        assert_eq!(a.run_id, b.run_id);
    }

    #[tokio::test]
    async fn start_run_with_same_key_and_different_payload_conflicts() {
        let store = InMemoryStateStore::new();
        store
            .start_run(GraphName::ExamPaper, serde_json::json!({}), Some("key-1".into()))
            .await
            .unwrap();
        let err = store
            .start_run(GraphName::ExamPaper, serde_json::json!({"different": true}), Some("key-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::IdempotencyConflict { key } if key == "key-1"));
    }

    #[tokio::test]
    async fn claim_pending_run_moves_to_running_and_opens_an_attempt() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        let claimed = store
            .claim_pending_run("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("one pending run");
        assert_eq!(claimed.run.run_id, run.run_id);
        assert_eq!(claimed.run.status, RunStatus::Running);
        assert_eq!(claimed.attempt.attempt_number, 1);

        assert!(store.claim_pending_run("worker-2", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_pending_run_is_immediately_terminal() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        assert!(store.cancel_run(run.run_id).await.unwrap());
        let run = store.get_run(run.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(!store.cancel_run(run.run_id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_running_run_requests_but_defers_to_cancel_run_terminal() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        store.claim_pending_run("worker-1", Duration::from_secs(30)).await.unwrap();

        assert!(store.cancel_run(run.run_id).await.unwrap());
        let running = store.get_run(run.run_id).await.unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.cancel_requested);

        store.cancel_run_terminal(run.run_id).await.unwrap();
        let cancelled = store.get_run(run.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn send_event_only_succeeds_while_paused() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        assert!(!store.send_event(run.run_id, serde_json::json!({})).await.unwrap());

        store.pause_run(run.run_id).await.unwrap();
        assert!(store.send_event(run.run_id, serde_json::json!({"action": "approve"})).await.unwrap());
        let run = store.get_run(run.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.resume_payload.is_some());
    }

    #[tokio::test]
    async fn sweep_expired_leases_returns_stuck_runs_to_pending() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        store.claim_pending_run("worker-1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let expired = store.sweep_expired_leases().await.unwrap();
        assert_eq!(expired, vec![run.run_id]);
        let run = store.get_run(run.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn write_checkpoint_chains_parent_ids() {
        let store = InMemoryStateStore::new();
        let run = store.start_run(GraphName::ExamPaper, serde_json::json!({}), None).await.unwrap();
        let first = store
            .write_checkpoint(run.run_id, None, serde_json::json!({"step": 1}), "segment".into(), serde_json::json!({}))
            .await
            .unwrap();
        let second = store
            .write_checkpoint(
                run.run_id,
                Some(first.checkpoint_id),
                serde_json::json!({"step": 2}),
                "aggregate".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        let latest = store.latest_checkpoint(run.run_id).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.parent_checkpoint_id, Some(first.checkpoint_id));
    }
}

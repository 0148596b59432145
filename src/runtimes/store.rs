//! The [`StateStore`] trait and the record types it persists (§3 Data
//! Model). Every backend — in-memory, SQLite, Postgres — implements this
//! trait identically; the Orchestrator and Worker Pool never see a concrete
//! backend type.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AttemptId, CheckpointId, RunId};
use crate::types::{GraphName, RunStatus};

/// Stable fingerprint of a `StartRun` payload, used to tell whether an
/// `idempotency_key` is being reused with the same or a different payload
/// (§6 `IDEMPOTENCY_CONFLICT`). Hashes the payload's JSON rendering, which
/// `serde_json::Value`'s `Display` impl emits with map keys in insertion
/// order — so this only recognizes identical payloads, not reordered ones.
#[must_use]
pub fn payload_fingerprint(payload: &serde_json::Value) -> u64 {
    let mut hasher = FxHasher::default();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

/// One execution of one named graph (§3 Data Model, `Run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub graph_name: GraphName,
    pub status: RunStatus,
    pub input_payload: serde_json::Value,
    pub output_payload: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub resume_payload: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

/// One claim-to-terminal pass over a run (§3 Data Model, `Attempt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub run_id: RunId,
    pub attempt_number: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One durable state snapshot in a run's checkpoint tree (§3 Data Model,
/// `Checkpoint`). `next_node` is the engine's encoded [`crate::types::NodeKind`]
/// to resume at — the checkpoint's equivalent of the source's `pending_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub state_snapshot: serde_json::Value,
    pub next_node: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A run claimed by [`StateStore::claim_pending_run`], bundled with the new
/// attempt and the latest checkpoint (if any) the worker should resume from.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: RunRecord,
    pub attempt: AttemptRecord,
    pub checkpoint: Option<CheckpointRecord>,
}

/// Filters accepted by `ListRuns` (§4.4). All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub graph_name: Option<GraphName>,
    pub status: Option<RunStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl RunFilter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Default::default()
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StateStoreError {
    #[error("run {run_id} not found")]
    #[diagnostic(code(examflow::store::not_found))]
    NotFound { run_id: RunId },

    #[error("idempotency key {key} already bound to a different run")]
    #[diagnostic(code(examflow::store::idempotency_conflict))]
    IdempotencyConflict { key: String },

    #[error("run {run_id} is not PAUSED")]
    #[diagnostic(code(examflow::store::not_paused))]
    NotPaused { run_id: RunId },

    #[error("run {run_id} is not FAILED")]
    #[diagnostic(code(examflow::store::not_failed))]
    NotFailed { run_id: RunId },

    #[error("state store backend error: {0}")]
    #[diagnostic(code(examflow::store::backend))]
    Backend(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error(transparent)]
    #[diagnostic(code(examflow::store::sqlx))]
    Sqlx(#[from] sqlx::Error),
}

/// Durable home for runs, attempts, and checkpoints (§3/§6). Implementors
/// must make `start_run`'s idempotency-key lookup-or-insert atomic and
/// `claim_pending_run`'s row selection exclusive across concurrent workers.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `StartRun`: idempotent by `idempotency_key` when present. Returns the
    /// existing run unchanged if the key was already bound to the same
    /// `input_payload`; returns `IdempotencyConflict` if it was bound to a
    /// different one.
    async fn start_run(
        &self,
        graph_name: GraphName,
        input_payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<RunRecord, StateStoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StateStoreError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>, StateStoreError>;

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<CheckpointRecord>, StateStoreError>;

    /// Atomically claims one `PENDING` run for `worker_id`: flips it to
    /// `RUNNING`, stamps a lease through `now + lease`, and opens a new
    /// attempt. Returns `None` when no run is claimable.
    async fn claim_pending_run(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedRun>, StateStoreError>;

    /// Extends a held lease; called periodically by the worker's heartbeat
    /// task while a run is in flight.
    async fn renew_lease(&self, run_id: RunId, worker_id: &str, lease: Duration) -> Result<(), StateStoreError>;

    /// Persists a new checkpoint and, in the same transaction, records the
    /// run's updated `progress`/`updated_at` — the atomic "intent + post-
    /// state" pairing the engine's checkpointing contract requires (§4.1).
    async fn write_checkpoint(
        &self,
        run_id: RunId,
        parent: Option<CheckpointId>,
        state_snapshot: serde_json::Value,
        next_node: String,
        metadata: serde_json::Value,
    ) -> Result<CheckpointRecord, StateStoreError>;

    async fn complete_run(&self, run_id: RunId, output_payload: serde_json::Value) -> Result<(), StateStoreError>;

    /// Marks a `RUNNING` run `CANCELLED` once the engine has wound down
    /// after observing `cancel_requested` mid-run (§4.1/§4.4). Distinct
    /// from `cancel_run`, which only *requests* cancellation and handles
    /// the immediate `PENDING`/`PAUSED` cases itself.
    async fn cancel_run_terminal(&self, run_id: RunId) -> Result<(), StateStoreError>;

    async fn fail_run(&self, run_id: RunId, error: String) -> Result<(), StateStoreError>;

    async fn pause_run(&self, run_id: RunId) -> Result<(), StateStoreError>;

    /// Returns a claimed run to `PENDING` without marking it terminal —
    /// used both by the lease janitor (crash recovery) and as the tail end
    /// of a graceful worker shutdown that had to abandon an in-flight run.
    async fn release_to_pending(&self, run_id: RunId) -> Result<(), StateStoreError>;

    /// `Cancel`: sets `cancel_requested`; if the run is `PENDING` or
    /// `PAUSED` it is marked `CANCELLED` immediately. Returns `false` if
    /// the run was already terminal.
    async fn cancel_run(&self, run_id: RunId) -> Result<bool, StateStoreError>;

    /// `SendEvent`: valid only while `PAUSED`. Writes the resume payload
    /// and flips the run back to `PENDING`.
    async fn send_event(
        &self,
        run_id: RunId,
        resume_payload: serde_json::Value,
    ) -> Result<bool, StateStoreError>;

    /// Returns every run whose lease has expired to `PENDING`, returning
    /// their ids. The worker pool's janitor task calls this on a timer.
    async fn sweep_expired_leases(&self) -> Result<Vec<RunId>, StateStoreError>;
}

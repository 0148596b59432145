//! Postgres-backed [`StateStore`] (§6): the production multi-writer backend.
//! `claim_pending_run` uses `SELECT ... FOR UPDATE SKIP LOCKED` (§4.5) so
//! concurrent workers never contend on the same candidate row and never
//! double-claim a run.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::ids::{AttemptId, CheckpointId, RunId};
use crate::types::{GraphName, RunStatus};

use super::store::{
    AttemptRecord, CheckpointRecord, ClaimedRun, RunFilter, RunRecord, StateStore, StateStoreError,
    payload_fingerprint,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id UUID PRIMARY KEY,
    graph_name TEXT NOT NULL,
    status TEXT NOT NULL,
    input_payload JSONB NOT NULL,
    output_payload JSONB,
    idempotency_key TEXT UNIQUE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    error TEXT,
    resume_payload JSONB,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    claimed_by TEXT,
    claimed_until TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS attempts (
    attempt_id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES runs(run_id),
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    error TEXT
);
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES runs(run_id),
    parent_checkpoint_id UUID,
    state_snapshot JSONB NOT NULL,
    next_node TEXT NOT NULL,
    metadata JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, created_at);
"#;

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub async fn connect(url: &str) -> Result<Self, StateStoreError> {
        let pool = PgPool::connect(url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<RunRecord, StateStoreError> {
        let graph_name: String = row.try_get("graph_name")?;
        let status: String = row.try_get("status")?;

        Ok(RunRecord {
            run_id: row.try_get::<uuid::Uuid, _>("run_id")?.into(),
            graph_name: graph_name.parse().map_err(StateStoreError::Backend)?,
            status: parse_status(&status)?,
            input_payload: row.try_get("input_payload")?,
            output_payload: row.try_get("output_payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            resume_payload: row.try_get("resume_payload")?,
            cancel_requested: row.try_get("cancel_requested")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<CheckpointRecord, StateStoreError> {
        Ok(CheckpointRecord {
            checkpoint_id: row.try_get::<uuid::Uuid, _>("checkpoint_id")?.into(),
            run_id: row.try_get::<uuid::Uuid, _>("run_id")?.into(),
            parent_checkpoint_id: row
                .try_get::<Option<uuid::Uuid>, _>("parent_checkpoint_id")?
                .map(Into::into),
            state_snapshot: row.try_get("state_snapshot")?,
            next_node: row.try_get("next_node")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn parse_status(s: &str) -> Result<RunStatus, StateStoreError> {
    Ok(match s {
        "pending" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "paused" => RunStatus::Paused,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        other => return Err(StateStoreError::Backend(format!("unknown run status: {other}"))),
    })
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn start_run(
        &self,
        graph_name: GraphName,
        input_payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<RunRecord, StateStoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = &idempotency_key {
            let existing = sqlx::query("SELECT * FROM runs WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = existing {
                let existing_run = Self::row_to_run(&row)?;
                if payload_fingerprint(&existing_run.input_payload) != payload_fingerprint(&input_payload) {
                    return Err(StateStoreError::IdempotencyConflict { key: key.clone() });
                }
                return Ok(existing_run);
            }
        }

        let run_id = RunId::new();
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO runs (run_id, graph_name, status, input_payload, idempotency_key, created_at, updated_at, cancel_requested) \
             VALUES ($1, $2, $3, $4, $5, $6, $6, FALSE) RETURNING *",
        )
        .bind(run_id.as_uuid())
        .bind(graph_name.to_string())
        .bind(status_str(RunStatus::Pending))
        .bind(&input_payload)
        .bind(&idempotency_key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Self::row_to_run(&row)
    }

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StateStoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StateStoreError::NotFound { run_id })?;
        Self::row_to_run(&row)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>, StateStoreError> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        let mut idx = 1;
        if filter.graph_name.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND graph_name = ${idx}"));
        }
        if filter.status.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND status = ${idx}"));
        }
        if filter.created_after.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND created_at >= ${idx}"));
        }
        if filter.created_before.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND created_at <= ${idx}"));
        }
        sql.push_str(&format!(" ORDER BY created_at ASC LIMIT ${} OFFSET ${}", idx + 1, idx + 2));

        let mut query = sqlx::query(&sql);
        if let Some(g) = filter.graph_name {
            query = query.bind(g.to_string());
        }
        if let Some(s) = filter.status {
            query = query.bind(status_str(s));
        }
        if let Some(t) = filter.created_after {
            query = query.bind(t);
        }
        if let Some(t) = filter.created_before {
            query = query.bind(t);
        }
        query = query.bind(filter.limit.max(1) as i64).bind(filter.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<CheckpointRecord>, StateStoreError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = $1 ORDER BY created_at DESC LIMIT 1")
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn claim_pending_run(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedRun>, StateStoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM runs WHERE status = 'pending' ORDER BY created_at ASC FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let run = Self::row_to_run(&row)?;

        let now = Utc::now();
        let claimed_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30));
        let row = sqlx::query(
            "UPDATE runs SET status = 'running', claimed_by = $1, claimed_until = $2, updated_at = $3 \
             WHERE run_id = $4 RETURNING *",
        )
        .bind(worker_id)
        .bind(claimed_until)
        .bind(now)
        .bind(run.run_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let run = Self::row_to_run(&row)?;

        let attempt_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM attempts WHERE run_id = $1")
            .bind(run.run_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        let attempt_number = attempt_count as u32 + 1;
        let attempt_id = AttemptId::new();
        sqlx::query(
            "INSERT INTO attempts (attempt_id, run_id, attempt_number, status, started_at) VALUES ($1, $2, $3, 'running', $4)",
        )
        .bind(attempt_id.as_uuid())
        .bind(run.run_id.as_uuid())
        .bind(attempt_number as i32)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let checkpoint_row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = $1 ORDER BY created_at DESC LIMIT 1")
            .bind(run.run_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let checkpoint = checkpoint_row.as_ref().map(Self::row_to_checkpoint).transpose()?;

        tx.commit().await?;

        Ok(Some(ClaimedRun {
            run,
            attempt: AttemptRecord {
                attempt_id,
                run_id: run.run_id,
                attempt_number,
                status: RunStatus::Running,
                started_at: now,
                completed_at: None,
                error: None,
            },
            checkpoint,
        }))
    }

    async fn renew_lease(&self, run_id: RunId, worker_id: &str, lease: Duration) -> Result<(), StateStoreError> {
        let now = Utc::now();
        let claimed_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30));
        sqlx::query("UPDATE runs SET claimed_until = $1 WHERE run_id = $2 AND claimed_by = $3")
            .bind(claimed_until)
            .bind(run_id.as_uuid())
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 AS x FROM runs WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StateStoreError::NotFound { run_id });
        }

        let checkpoint_id = CheckpointId::new();
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO checkpoints (checkpoint_id, run_id, parent_checkpoint_id, state_snapshot, next_node, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(checkpoint_id.as_uuid())
        .bind(run_id.as_uuid())
        .bind(parent.map(|p| p.as_uuid()))
        .bind(&state_snapshot)
        .bind(&next_node)
        .bind(&metadata)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE runs SET updated_at = $1 WHERE run_id = $2")
            .bind(now)
            .bind(run_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Self::row_to_checkpoint(&row)
    }

    async fn complete_run(&self, run_id: RunId, output_payload: serde_json::Value) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'completed', output_payload = $1, completed_at = $2, updated_at = $2, claimed_by = NULL, claimed_until = NULL WHERE run_id = $3",
        )
        .bind(output_payload)
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_run_terminal(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'cancelled', completed_at = $1, updated_at = $1, claimed_by = NULL, claimed_until = NULL WHERE run_id = $2",
        )
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, error: String) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'failed', error = $1, completed_at = $2, updated_at = $2, claimed_by = NULL, claimed_until = NULL WHERE run_id = $3",
        )
        .bind(error)
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pause_run(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'paused', updated_at = $1, claimed_by = NULL, claimed_until = NULL WHERE run_id = $2",
        )
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_to_pending(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'pending', claimed_by = NULL, claimed_until = NULL, updated_at = $1 \
             WHERE run_id = $2 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<bool, StateStoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = TRUE, \
             status = CASE WHEN status IN ('pending', 'paused') THEN 'cancelled' ELSE status END, \
             completed_at = CASE WHEN status IN ('pending', 'paused') THEN $1 ELSE completed_at END, \
             updated_at = $1 \
             WHERE run_id = $2 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn send_event(
        &self,
        run_id: RunId,
        resume_payload: serde_json::Value,
    ) -> Result<bool, StateStoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE runs SET resume_payload = $1, status = 'pending', updated_at = $2 WHERE run_id = $3 AND status = 'paused'",
        )
        .bind(resume_payload)
        .bind(now)
        .bind(run_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired_leases(&self) -> Result<Vec<RunId>, StateStoreError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "UPDATE runs SET status = 'pending', claimed_by = NULL, claimed_until = NULL, updated_at = $1 \
             WHERE status = 'running' AND claimed_until < $1 RETURNING run_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<uuid::Uuid, _>("run_id").map(Into::into))
            .collect::<Result<Vec<_>, _>>()?)
    }
}

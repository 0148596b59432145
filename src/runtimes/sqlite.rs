//! SQLite-backed [`StateStore`] (§6): single-writer, so `claim_pending_run`
//! is a plain `UPDATE ... WHERE run_id = (SELECT ...)` rather than `FOR
//! UPDATE SKIP LOCKED` — SQLite serializes writers at the connection-pool
//! level, which gives the same "exactly one worker wins the claim" property
//! without row-level locking. [`super::postgres::PostgresStateStore`] is the
//! production multi-writer backend; this one is for local/dev use and the
//! crate's own integration tests when `moka`/in-memory state isn't enough.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::ids::{AttemptId, CheckpointId, RunId};
use crate::types::{GraphName, RunStatus};

use super::store::{
    AttemptRecord, CheckpointRecord, ClaimedRun, RunFilter, RunRecord, StateStore, StateStoreError,
    payload_fingerprint,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    graph_name TEXT NOT NULL,
    status TEXT NOT NULL,
    input_payload TEXT NOT NULL,
    output_payload TEXT,
    idempotency_key TEXT UNIQUE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT,
    resume_payload TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    claimed_until TEXT
);
CREATE TABLE IF NOT EXISTS attempts (
    attempt_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT
);
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    parent_checkpoint_id TEXT,
    state_snapshot TEXT NOT NULL,
    next_node TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, created_at);
"#;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn connect(url: &str) -> Result<Self, StateStoreError> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord, StateStoreError> {
        let graph_name: String = row.try_get("graph_name")?;
        let status: String = row.try_get("status")?;
        let input_payload: String = row.try_get("input_payload")?;
        let output_payload: Option<String> = row.try_get("output_payload")?;
        let resume_payload: Option<String> = row.try_get("resume_payload")?;
        let run_id: String = row.try_get("run_id")?;

        Ok(RunRecord {
            run_id: run_id.parse().map_err(|_| StateStoreError::Backend("bad run_id".into()))?,
            graph_name: graph_name.parse().map_err(StateStoreError::Backend)?,
            status: parse_status(&status)?,
            input_payload: serde_json::from_str(&input_payload).map_err(|e| StateStoreError::Backend(e.to_string()))?,
            output_payload: output_payload
                .map(|v| serde_json::from_str(&v))
                .transpose()
                .map_err(|e| StateStoreError::Backend(e.to_string()))?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get::<String, _>("created_at")?.parse().map_err(|_| StateStoreError::Backend("bad timestamp".into()))?,
            updated_at: row.try_get::<String, _>("updated_at")?.parse().map_err(|_| StateStoreError::Backend("bad timestamp".into()))?,
            completed_at: parse_optional_ts(row.try_get("completed_at")?)?,
            error: row.try_get("error")?,
            resume_payload: resume_payload
                .map(|v| serde_json::from_str(&v))
                .transpose()
                .map_err(|e| StateStoreError::Backend(e.to_string()))?,
            cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: parse_optional_ts(row.try_get("claimed_until")?)?,
        })
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<CheckpointRecord, StateStoreError> {
        let checkpoint_id: String = row.try_get("checkpoint_id")?;
        let run_id: String = row.try_get("run_id")?;
        let parent: Option<String> = row.try_get("parent_checkpoint_id")?;
        Ok(CheckpointRecord {
            checkpoint_id: checkpoint_id.parse().map_err(|_| StateStoreError::Backend("bad checkpoint_id".into()))?,
            run_id: run_id.parse().map_err(|_| StateStoreError::Backend("bad run_id".into()))?,
            parent_checkpoint_id: parent
                .map(|p| p.parse())
                .transpose()
                .map_err(|_| StateStoreError::Backend("bad parent_checkpoint_id".into()))?,
            state_snapshot: serde_json::from_str(&row.try_get::<String, _>("state_snapshot")?)
                .map_err(|e| StateStoreError::Backend(e.to_string()))?,
            next_node: row.try_get("next_node")?,
            metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)
                .map_err(|e| StateStoreError::Backend(e.to_string()))?,
            created_at: row.try_get::<String, _>("created_at")?.parse().map_err(|_| StateStoreError::Backend("bad timestamp".into()))?,
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

fn parse_optional_ts(raw: Option<String>) -> Result<Option<chrono::DateTime<Utc>>, StateStoreError> {
    raw.map(|s| s.parse::<chrono::DateTime<Utc>>())
        .transpose()
        .map_err(|_| StateStoreError::Backend("bad timestamp".into()))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn start_run(
        &self,
        graph_name: GraphName,
        input_payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<RunRecord, StateStoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = &idempotency_key {
            let existing = sqlx::query("SELECT * FROM runs WHERE idempotency_key = ?1")
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
        sqlx::query(
            "INSERT INTO runs (run_id, graph_name, status, input_payload, idempotency_key, created_at, updated_at, cancel_requested) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)",
        )
        .bind(run_id.to_string())
        .bind(graph_name.to_string())
        .bind(status_str(RunStatus::Pending))
        .bind(input_payload.to_string())
        .bind(&idempotency_key)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(RunRecord {
            run_id,
            graph_name,
            status: RunStatus::Pending,
            input_payload,
            output_payload: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            resume_payload: None,
            cancel_requested: false,
            claimed_by: None,
            claimed_until: None,
        })
    }

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StateStoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StateStoreError::NotFound { run_id })?;
        Self::row_to_run(&row)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRecord>, StateStoreError> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        if filter.graph_name.is_some() {
            sql.push_str(" AND graph_name = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.created_after.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.created_before.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(g) = filter.graph_name {
            query = query.bind(g.to_string());
        }
        if let Some(s) = filter.status {
            query = query.bind(status_str(s));
        }
        if let Some(t) = filter.created_after {
            query = query.bind(t.to_rfc3339());
        }
        if let Some(t) = filter.created_before {
            query = query.bind(t.to_rfc3339());
        }
        query = query.bind(filter.limit.max(1) as i64).bind(filter.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<CheckpointRecord>, StateStoreError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ?1 ORDER BY created_at DESC LIMIT 1")
            .bind(run_id.to_string())
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
        let candidate = sqlx::query("SELECT run_id FROM runs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let run_id_str: String = candidate.try_get("run_id")?;
        let run_id: RunId = run_id_str.parse().map_err(|_| StateStoreError::Backend("bad run_id".into()))?;

        let now = Utc::now();
        let claimed_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30));
        let updated = sqlx::query(
            "UPDATE runs SET status = 'running', claimed_by = ?1, claimed_until = ?2, updated_at = ?3 \
             WHERE run_id = ?4 AND status = 'pending'",
        )
        .bind(worker_id)
        .bind(claimed_until.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let attempt_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM attempts WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        let attempt_number = attempt_count as u32 + 1;
        let attempt_id = AttemptId::new();
        sqlx::query(
            "INSERT INTO attempts (attempt_id, run_id, attempt_number, status, started_at) VALUES (?1, ?2, ?3, 'running', ?4)",
        )
        .bind(attempt_id.to_string())
        .bind(run_id.to_string())
        .bind(attempt_number as i64)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let run_row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let run = Self::row_to_run(&run_row)?;

        let checkpoint_row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ?1 ORDER BY created_at DESC LIMIT 1")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let checkpoint = checkpoint_row.as_ref().map(Self::row_to_checkpoint).transpose()?;

        tx.commit().await?;

        Ok(Some(ClaimedRun {
            run,
            attempt: AttemptRecord {
                attempt_id,
                run_id,
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
        sqlx::query("UPDATE runs SET claimed_until = ?1 WHERE run_id = ?2 AND claimed_by = ?3")
            .bind(claimed_until.to_rfc3339())
            .bind(run_id.to_string())
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
        let exists = sqlx::query("SELECT 1 AS x FROM runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StateStoreError::NotFound { run_id });
        }

        let checkpoint_id = CheckpointId::new();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO checkpoints (checkpoint_id, run_id, parent_checkpoint_id, state_snapshot, next_node, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(checkpoint_id.to_string())
        .bind(run_id.to_string())
        .bind(parent.map(|p| p.to_string()))
        .bind(state_snapshot.to_string())
        .bind(&next_node)
        .bind(metadata.to_string())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE runs SET updated_at = ?1 WHERE run_id = ?2")
            .bind(now.to_rfc3339())
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CheckpointRecord {
            checkpoint_id,
            run_id,
            parent_checkpoint_id: parent,
            state_snapshot,
            next_node,
            metadata,
            created_at: now,
        })
    }

    async fn complete_run(&self, run_id: RunId, output_payload: serde_json::Value) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'completed', output_payload = ?1, completed_at = ?2, updated_at = ?2, claimed_by = NULL, claimed_until = NULL WHERE run_id = ?3",
        )
        .bind(output_payload.to_string())
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_run_terminal(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'cancelled', completed_at = ?1, updated_at = ?1, claimed_by = NULL, claimed_until = NULL WHERE run_id = ?2",
        )
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, error: String) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2, claimed_by = NULL, claimed_until = NULL WHERE run_id = ?3",
        )
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pause_run(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'paused', updated_at = ?1, claimed_by = NULL, claimed_until = NULL WHERE run_id = ?2",
        )
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_to_pending(&self, run_id: RunId) -> Result<(), StateStoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE runs SET status = 'pending', claimed_by = NULL, claimed_until = NULL, updated_at = ?1 \
             WHERE run_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<bool, StateStoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = 1, \
             status = CASE WHEN status IN ('pending', 'paused') THEN 'cancelled' ELSE status END, \
             completed_at = CASE WHEN status IN ('pending', 'paused') THEN ?1 ELSE completed_at END, \
             updated_at = ?1 \
             WHERE run_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
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
            "UPDATE runs SET resume_payload = ?1, status = 'pending', updated_at = ?2 WHERE run_id = ?3 AND status = 'paused'",
        )
        .bind(resume_payload.to_string())
        .bind(now.to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired_leases(&self) -> Result<Vec<RunId>, StateStoreError> {
        let now = Utc::now();
        let rows = sqlx::query("SELECT run_id FROM runs WHERE status = 'running' AND claimed_until < ?1")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<RunId> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("run_id").unwrap().parse().unwrap())
            .collect();
        if !ids.is_empty() {
            sqlx::query(
                "UPDATE runs SET status = 'pending', claimed_by = NULL, claimed_until = NULL, updated_at = ?1 \
                 WHERE status = 'running' AND claimed_until < ?1",
            )
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        Ok(ids)
    }
}

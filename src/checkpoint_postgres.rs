//! Postgres checkpoint store, shared with the orchestrator.
//!
//! Server-mode runs checkpoint into the `workflow_checkpoints` table next to
//! `workflow_runs`, so the control-plane API can read the full superstep
//! trace of any run with plain queries.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::checkpoint::{
    CheckpointStore, Snapshot, StoreResult, decode_snapshot, encode_snapshot,
};

pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Wrap an existing pool; the schema is managed by `db::Database`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&self, run_id: uuid::Uuid, snapshot: &Snapshot) -> StoreResult<()> {
        let bytes = encode_snapshot(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (run_id, superstep, snapshot, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (run_id, superstep) DO UPDATE SET
                snapshot = EXCLUDED.snapshot,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(run_id)
        .bind(snapshot.superstep as i64)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_latest(&self, run_id: uuid::Uuid) -> StoreResult<Option<Snapshot>> {
        let row: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT snapshot FROM workflow_checkpoints
            WHERE run_id = $1
            ORDER BY superstep DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|bytes| decode_snapshot(&bytes)).transpose()
    }

    async fn list(&self, run_id: uuid::Uuid) -> StoreResult<Vec<Snapshot>> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT snapshot FROM workflow_checkpoints
            WHERE run_id = $1
            ORDER BY superstep
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|bytes| decode_snapshot(bytes)).collect()
    }

    async fn purge_expired(&self, ttl_secs: i64) -> StoreResult<u64> {
        // Only terminal runs expire; a run paused in needs_input keeps its
        // checkpoints indefinitely.
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_checkpoints
            WHERE run_id IN (
                SELECT run_id FROM workflow_runs
                WHERE status IN ('succeeded', 'failed', 'canceled')
                  AND updated_at < now() - ($1 * INTERVAL '1 second')
            )
            "#,
        )
        .bind(ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

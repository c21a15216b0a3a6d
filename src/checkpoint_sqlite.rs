//! Embedded single-file checkpoint store.
//!
//! Used by the standalone CLI so a run can checkpoint and resume without a
//! server. One SQLite file holds the full snapshot history of every run
//! executed against it.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::checkpoint::{
    CheckpointStore, Snapshot, StoreResult, decode_snapshot, encode_snapshot,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_checkpoints (
    run_id     TEXT    NOT NULL,
    superstep  INTEGER NOT NULL,
    snapshot   BLOB    NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (run_id, superstep)
);
CREATE INDEX IF NOT EXISTS idx_workflow_checkpoints_created
    ON workflow_checkpoints (created_at);
"#;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (and create if missing) a checkpoint database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::from_options(options).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?;
        Self::from_options(options).await
    }

    async fn from_options(options: SqliteConnectOptions) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, run_id: uuid::Uuid, snapshot: &Snapshot) -> StoreResult<()> {
        let bytes = encode_snapshot(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (run_id, superstep, snapshot, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id, superstep) DO UPDATE SET
                snapshot = excluded.snapshot,
                created_at = excluded.created_at
            "#,
        )
        .bind(run_id.to_string())
        .bind(snapshot.superstep as i64)
        .bind(bytes)
        .bind(chrono::Utc::now().timestamp())
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
        .bind(run_id.to_string())
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
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|bytes| decode_snapshot(bytes)).collect()
    }

    async fn purge_expired(&self, ttl_secs: i64) -> StoreResult<u64> {
        // CLI runs never idle in needs_input, so snapshot age is a safe
        // stand-in for time since the run finished.
        let cutoff = chrono::Utc::now().timestamp() - ttl_secs;
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_checkpoints
            WHERE run_id IN (
                SELECT run_id FROM workflow_checkpoints
                GROUP BY run_id
                HAVING MAX(created_at) < $1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

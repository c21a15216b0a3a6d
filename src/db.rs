//! PostgreSQL layer: runs, triggers, and the distributed claim queue.
//!
//! `workflow_runs` is the job queue. Claiming is a single transaction built
//! on `FOR UPDATE SKIP LOCKED`, which gives at-most-once claiming under
//! concurrent workers; a claim whose `claimed_at` has gone stale is eligible
//! for reclaim. The run row is the serialization point for a run: only its
//! current claimant mutates it, and every claimant-side update is guarded by
//! `claimed_by` so a worker that lost its claim finds out (`ClaimLost`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct TriggerId(pub Uuid);

impl TriggerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run lifecycle states (wire values are the lowercase snake_case names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    NeedsInput,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::NeedsInput => "needs_input",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "needs_input" => Some(RunStatus::NeedsInput),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub template_name: String,
    pub workflow_hash: Option<String>,
    pub inputs: JsonValue,
    pub status: String,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub resume_payload: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn status(&self) -> RunStatus {
        RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowTrigger {
    pub trigger_id: TriggerId,
    pub name: String,
    pub template_name: String,
    pub inputs_template: JsonValue,
    pub cron_expression: String,
    pub timezone: String,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a trigger; `next_run_at` is precomputed by the caller
/// after cron validation.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub name: String,
    pub template_name: String,
    pub inputs_template: JsonValue,
    pub cron_expression: String,
    pub timezone: String,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Partial update for a trigger; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct TriggerPatch {
    pub name: Option<String>,
    pub template_name: Option<String>,
    pub inputs_template: Option<JsonValue>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub is_active: Option<bool>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was not executing; it is now `canceled`.
    Canceled,
    /// The run is executing; the claimant will observe the flag.
    CancelRequested,
    NotFound,
    /// Terminal runs cannot be canceled.
    IllegalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    Requeued,
    NotFound,
    /// Only `needs_input` and `failed` runs can be continued.
    IllegalState,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id           UUID PRIMARY KEY,
    template_name    TEXT NOT NULL,
    workflow_hash    TEXT,
    inputs           JSONB NOT NULL DEFAULT '{}'::jsonb,
    status           TEXT NOT NULL DEFAULT 'queued',
    result           JSONB,
    error            TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    claimed_by       TEXT,
    claimed_at       TIMESTAMPTZ,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    resume_payload   JSONB,
    started_at       TIMESTAMPTZ,
    finished_at      TIMESTAMPTZ,
    heartbeat_at     TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_queue
    ON workflow_runs (status, created_at);

CREATE TABLE IF NOT EXISTS workflow_triggers (
    trigger_id      UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    template_name   TEXT NOT NULL,
    inputs_template JSONB NOT NULL DEFAULT '{}'::jsonb,
    cron_expression TEXT NOT NULL,
    timezone        TEXT NOT NULL DEFAULT 'UTC',
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    next_run_at     TIMESTAMPTZ,
    last_run_at     TIMESTAMPTZ,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_workflow_triggers_due
    ON workflow_triggers (is_active, next_run_at);

CREATE TABLE IF NOT EXISTS workflow_checkpoints (
    run_id     UUID NOT NULL,
    superstep  BIGINT NOT NULL,
    snapshot   BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (run_id, superstep)
);
"#;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    pub async fn connect_with_pool_size(database_url: &str, pool_size: u32) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> DbResult<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    pub async fn create_run(
        &self,
        template_name: &str,
        workflow_hash: Option<&str>,
        inputs: &JsonValue,
    ) -> DbResult<WorkflowRun> {
        let run_id = RunId::new();
        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            INSERT INTO workflow_runs (run_id, template_name, workflow_hash, inputs, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(template_name)
        .bind(workflow_hash)
        .bind(inputs)
        .fetch_one(&self.pool)
        .await?;
        metrics::counter!("wirl_runs_enqueued_total").increment(1);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: RunId) -> DbResult<Option<WorkflowRun>> {
        let run = sqlx::query_as::<_, WorkflowRun>(
            "SELECT * FROM workflow_runs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn list_runs(&self, limit: i64, offset: i64) -> DbResult<(Vec<WorkflowRun>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_runs")
            .fetch_one(&self.pool)
            .await?;
        let runs = sqlx::query_as::<_, WorkflowRun>(
            r#"
            SELECT * FROM workflow_runs
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((runs, total))
    }

    /// Claim the oldest claimable run for `worker_id`. Queued runs are
    /// claimable, as are `running` rows whose claim has gone stale (crashed
    /// or partitioned claimant).
    pub async fn claim_next_run(
        &self,
        worker_id: &str,
        stale_timeout_secs: i64,
    ) -> DbResult<Option<WorkflowRun>> {
        let span = tracing::info_span!("db.claim_next_run", worker = worker_id);
        let _guard = span.enter();
        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            WITH next AS (
                SELECT run_id
                FROM workflow_runs
                WHERE (status = 'queued'
                       AND (claimed_by IS NULL OR claimed_at < now() - $2 * INTERVAL '1 second'))
                   OR (status = 'running'
                       AND claimed_at < now() - $2 * INTERVAL '1 second')
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_runs AS runs
            SET status = 'running',
                claimed_by = $1,
                claimed_at = now(),
                started_at = COALESCE(runs.started_at, now()),
                heartbeat_at = now(),
                updated_at = now()
            FROM next
            WHERE runs.run_id = next.run_id
            RETURNING runs.*
            "#,
        )
        .bind(worker_id)
        .bind(stale_timeout_secs)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(run) = &run {
            metrics::counter!("wirl_runs_claimed_total").increment(1);
            debug!(run_id = %run.run_id, template = %run.template_name, "claimed run");
        }
        Ok(run)
    }

    /// Refresh the claim while executing. Returns false when the claim was
    /// lost (reclaimed by another worker or canceled directly).
    pub async fn refresh_claim(&self, run_id: RunId, worker_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET heartbeat_at = now(), claimed_at = now(), updated_at = now()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn cancel_requested(&self, run_id: RunId) -> DbResult<bool> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM workflow_runs WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(requested.unwrap_or(false))
    }

    /// Terminal success. Guarded by the claim; false means `ClaimLost`.
    pub async fn complete_run(
        &self,
        run_id: RunId,
        worker_id: &str,
        result: &JsonValue,
    ) -> DbResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'succeeded',
                result = $3,
                error = NULL,
                resume_payload = NULL,
                claimed_by = NULL,
                finished_at = now(),
                updated_at = now()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    pub async fn fail_run(&self, run_id: RunId, worker_id: &str, error: &str) -> DbResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed',
                error = $3,
                resume_payload = NULL,
                claimed_by = NULL,
                finished_at = now(),
                updated_at = now()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    /// HITL suspension: release the claim and wait for `continue`.
    pub async fn suspend_run(&self, run_id: RunId, worker_id: &str) -> DbResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'needs_input',
                resume_payload = NULL,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = now()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    pub async fn mark_canceled(&self, run_id: RunId, worker_id: &str) -> DbResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'canceled',
                resume_payload = NULL,
                claimed_by = NULL,
                finished_at = now(),
                updated_at = now()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    /// API cancel: queued/needs_input runs cancel directly, running runs get
    /// the cooperative flag, terminal runs are illegal.
    pub async fn cancel_run(&self, run_id: RunId) -> DbResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM workflow_runs WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(status) = status else {
            return Ok(CancelOutcome::NotFound);
        };
        let outcome = match RunStatus::parse(&status) {
            Some(RunStatus::Queued) | Some(RunStatus::NeedsInput) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'canceled',
                        cancel_requested = TRUE,
                        claimed_by = NULL,
                        finished_at = now(),
                        updated_at = now()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
                CancelOutcome::Canceled
            }
            Some(RunStatus::Running) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET cancel_requested = TRUE, updated_at = now()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
                CancelOutcome::CancelRequested
            }
            _ => CancelOutcome::IllegalState,
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// API continue: resume a HITL pause (with a payload) or retry a failed
    /// run from its latest checkpoint.
    pub async fn continue_run(
        &self,
        run_id: RunId,
        resume_payload: Option<&JsonValue>,
    ) -> DbResult<ContinueOutcome> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM workflow_runs WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(status) = status else {
            return Ok(ContinueOutcome::NotFound);
        };
        let outcome = match RunStatus::parse(&status) {
            Some(RunStatus::NeedsInput) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'queued',
                        resume_payload = $2,
                        cancel_requested = FALSE,
                        claimed_by = NULL,
                        claimed_at = NULL,
                        updated_at = now()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .bind(resume_payload)
                .execute(&mut *tx)
                .await?;
                ContinueOutcome::Requeued
            }
            Some(RunStatus::Failed) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'queued',
                        retry_count = retry_count + 1,
                        error = NULL,
                        cancel_requested = FALSE,
                        claimed_by = NULL,
                        claimed_at = NULL,
                        updated_at = now()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
                ContinueOutcome::Requeued
            }
            _ => ContinueOutcome::IllegalState,
        };
        tx.commit().await?;
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Triggers
    // -------------------------------------------------------------------------

    pub async fn create_trigger(&self, new: &NewTrigger) -> DbResult<WorkflowTrigger> {
        let trigger = sqlx::query_as::<_, WorkflowTrigger>(
            r#"
            INSERT INTO workflow_triggers
                (trigger_id, name, template_name, inputs_template,
                 cron_expression, timezone, is_active, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(TriggerId::new())
        .bind(&new.name)
        .bind(&new.template_name)
        .bind(&new.inputs_template)
        .bind(&new.cron_expression)
        .bind(&new.timezone)
        .bind(new.is_active)
        .bind(new.next_run_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(trigger)
    }

    pub async fn get_trigger(&self, trigger_id: TriggerId) -> DbResult<Option<WorkflowTrigger>> {
        let trigger = sqlx::query_as::<_, WorkflowTrigger>(
            "SELECT * FROM workflow_triggers WHERE trigger_id = $1",
        )
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(trigger)
    }

    pub async fn list_triggers(&self) -> DbResult<Vec<WorkflowTrigger>> {
        let triggers = sqlx::query_as::<_, WorkflowTrigger>(
            "SELECT * FROM workflow_triggers ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(triggers)
    }

    pub async fn update_trigger(
        &self,
        trigger_id: TriggerId,
        patch: &TriggerPatch,
    ) -> DbResult<Option<WorkflowTrigger>> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = sqlx::query_as::<_, WorkflowTrigger>(
            "SELECT * FROM workflow_triggers WHERE trigger_id = $1 FOR UPDATE",
        )
        .bind(trigger_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let name = patch.name.clone().unwrap_or(current.name);
        let template_name = patch.template_name.clone().unwrap_or(current.template_name);
        let inputs_template = patch
            .inputs_template
            .clone()
            .unwrap_or(current.inputs_template);
        let cron_expression = patch
            .cron_expression
            .clone()
            .unwrap_or(current.cron_expression);
        let timezone = patch.timezone.clone().unwrap_or(current.timezone);
        let is_active = patch.is_active.unwrap_or(current.is_active);
        let next_run_at = patch.next_run_at.unwrap_or(current.next_run_at);
        let last_error = patch.last_error.clone().unwrap_or(current.last_error);

        let updated = sqlx::query_as::<_, WorkflowTrigger>(
            r#"
            UPDATE workflow_triggers
            SET name = $2,
                template_name = $3,
                inputs_template = $4,
                cron_expression = $5,
                timezone = $6,
                is_active = $7,
                next_run_at = $8,
                last_error = $9,
                updated_at = now()
            WHERE trigger_id = $1
            RETURNING *
            "#,
        )
        .bind(trigger_id)
        .bind(&name)
        .bind(&template_name)
        .bind(&inputs_template)
        .bind(&cron_expression)
        .bind(&timezone)
        .bind(is_active)
        .bind(next_run_at)
        .bind(&last_error)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    pub async fn delete_trigger(&self, trigger_id: TriggerId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_triggers WHERE trigger_id = $1")
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // Scheduler transaction helpers
    // -------------------------------------------------------------------------

    pub async fn begin(&self) -> DbResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Lock every due trigger for this tick. `SKIP LOCKED` ensures a trigger
    /// is processed by exactly one scheduler even when several poll at once.
    pub async fn due_triggers_tx(
        tx: &mut Transaction<'static, Postgres>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<WorkflowTrigger>> {
        let triggers = sqlx::query_as::<_, WorkflowTrigger>(
            r#"
            SELECT * FROM workflow_triggers
            WHERE is_active AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut **tx)
        .await?;
        Ok(triggers)
    }

    pub async fn insert_run_tx(
        tx: &mut Transaction<'static, Postgres>,
        template_name: &str,
        inputs: &JsonValue,
    ) -> DbResult<RunId> {
        let run_id = RunId::new();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, template_name, inputs, status)
            VALUES ($1, $2, $3, 'queued')
            "#,
        )
        .bind(run_id)
        .bind(template_name)
        .bind(inputs)
        .execute(&mut **tx)
        .await?;
        metrics::counter!("wirl_trigger_runs_enqueued_total").increment(1);
        Ok(run_id)
    }

    /// Record the outcome of firing (or failing to fire) a trigger.
    pub async fn update_trigger_fire_tx(
        tx: &mut Transaction<'static, Postgres>,
        trigger_id: TriggerId,
        is_active: bool,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_triggers
            SET is_active = $2,
                next_run_at = $3,
                last_run_at = COALESCE($4, last_run_at),
                last_error = $5,
                updated_at = now()
            WHERE trigger_id = $1
            "#,
        )
        .bind(trigger_id)
        .bind(is_active)
        .bind(next_run_at)
        .bind(last_run_at)
        .bind(last_error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

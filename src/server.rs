//! Control-plane HTTP API.
//!
//! A thin JSON layer over the orchestrator state: it reads and writes
//! `workflow_runs` and `workflow_triggers`, lists compiled templates, and
//! reconstructs per-superstep traces from the checkpoint sequence. Errors
//! map to 400 for validation, 404 for unknown ids, 409 for illegal state
//! transitions, and 500 for unexpected store failures.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, WriteKind};
use crate::db::{
    CancelOutcome, ContinueOutcome, Database, NewTrigger, RunId, RunStatus, TriggerId,
    TriggerPatch, WorkflowRun, WorkflowTrigger,
};
use crate::schedule::{first_fire, validate_schedule};
use crate::templates::{TemplateInfo, TemplateStore};
use crate::value::Value;

/// API server handle.
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl ApiServer {
    pub async fn start(
        bind_addr: SocketAddr,
        db: Database,
        templates: Arc<TemplateStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let actual_addr = listener.local_addr()?;

        let state = ApiState {
            db,
            templates,
            checkpoints,
        };
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(run_server(listener, state, shutdown_rx));

        info!(addr = %actual_addr, "api server started");
        Ok(Self {
            addr: actual_addr,
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Clone)]
struct ApiState {
    db: Database,
    templates: Arc<TemplateStore>,
    checkpoints: Arc<dyn CheckpointStore>,
}

async fn run_server(
    listener: TcpListener,
    state: ApiState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let app = Router::new()
        .route("/workflow-templates", get(list_templates))
        .route("/workflows", get(list_workflows).post(start_workflow))
        .route("/workflows/:id", get(workflow_detail))
        .route("/workflows/:id/run-details", get(workflow_run_details))
        .route("/workflows/:id/continue", post(continue_workflow))
        .route("/workflows/:id/cancel", post(cancel_workflow))
        .route("/workflow-triggers", get(list_triggers).post(create_trigger))
        .route(
            "/workflow-triggers/:id",
            axum::routing::patch(update_trigger).delete(delete_trigger),
        )
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Internal(message) => {
                error!(%message, "internal api error");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(serde_json::json!({ "detail": message }))).into_response()
    }
}

impl From<crate::db::DbError> for ApiError {
    fn from(err: crate::db::DbError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    Uuid::parse_str(id)
        .map(RunId)
        .map_err(|_| ApiError::NotFound("Workflow not found".to_string()))
}

fn parse_trigger_id(id: &str) -> Result<TriggerId, ApiError> {
    Uuid::parse_str(id)
        .map(TriggerId)
        .map_err(|_| ApiError::NotFound("Trigger not found".to_string()))
}

// ============================================================================
// Templates
// ============================================================================

async fn list_templates(State(state): State<ApiState>) -> Json<Vec<TemplateInfo>> {
    Json(state.templates.list())
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
struct RunSummary {
    id: RunId,
    template: String,
    status: RunStatus,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct RunPage {
    total: i64,
    limit: i64,
    offset: i64,
    items: Vec<RunSummary>,
}

async fn list_workflows(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<RunPage>, ApiError> {
    let limit = page.limit.clamp(1, 100);
    let offset = page.offset.max(0);
    let (runs, total) = state.db.list_runs(limit, offset).await?;
    let items = runs
        .into_iter()
        .map(|run| RunSummary {
            id: run.run_id,
            template: run.template_name.clone(),
            status: run.status(),
            created_at: run.created_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(RunPage {
        total,
        limit,
        offset,
        items,
    }))
}

#[derive(Debug, Serialize)]
struct RunDetail {
    id: RunId,
    template: String,
    status: RunStatus,
    inputs: JsonValue,
    result: JsonValue,
    error: Option<String>,
}

impl RunDetail {
    fn from_run(run: WorkflowRun) -> Self {
        Self {
            id: run.run_id,
            template: run.template_name.clone(),
            status: run.status(),
            inputs: run.inputs.clone(),
            result: run.result.clone().unwrap_or(JsonValue::Object(Default::default())),
            error: run.error.clone(),
        }
    }
}

async fn workflow_detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workflow not found".to_string()))?;
    Ok(Json(RunDetail::from_run(run)))
}

#[derive(Debug, Deserialize)]
struct StartWorkflowRequest {
    template_name: String,
    #[serde(default)]
    inputs: JsonValue,
}

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: RunId,
    status: RunStatus,
    result: JsonValue,
}

async fn start_workflow(
    State(state): State<ApiState>,
    Json(request): Json<StartWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = state
        .templates
        .load(&request.template_name)
        .await
        .map_err(|err| match err {
            crate::templates::TemplateError::NotFound(_) => {
                ApiError::NotFound("Template not found".to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        })?;

    let inputs = match &request.inputs {
        JsonValue::Null => JsonValue::Object(Default::default()),
        JsonValue::Object(_) => request.inputs.clone(),
        _ => {
            return Err(ApiError::BadRequest(
                "inputs must be a JSON object".to_string(),
            ));
        }
    };

    let run = state
        .db
        .create_run(
            &request.template_name,
            Some(workflow.source_hash.as_str()),
            &inputs,
        )
        .await?;
    Ok(Json(WorkflowResponse {
        id: run.run_id,
        status: run.status(),
        result: JsonValue::Object(Default::default()),
    }))
}

#[derive(Debug, Deserialize)]
struct ContinueWorkflowRequest {
    #[serde(default)]
    inputs: JsonValue,
}

async fn continue_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ContinueWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let run_id = parse_run_id(&id)?;
    // The resume payload reaches the suspended node as its `answer` input.
    let resume = match &request.inputs {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other.clone(),
    };
    let outcome = state.db.continue_run(run_id, Some(&resume)).await?;
    match outcome {
        ContinueOutcome::Requeued => {}
        ContinueOutcome::NotFound => {
            return Err(ApiError::NotFound("Workflow not found".to_string()));
        }
        ContinueOutcome::IllegalState => {
            return Err(ApiError::Conflict(
                "Workflow can't be continued".to_string(),
            ));
        }
    }
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workflow not found".to_string()))?;
    Ok(Json(WorkflowResponse {
        id: run.run_id,
        status: run.status(),
        result: run.result.unwrap_or(JsonValue::Object(Default::default())),
    }))
}

async fn cancel_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let outcome = state.db.cancel_run(run_id).await?;
    match outcome {
        CancelOutcome::Canceled | CancelOutcome::CancelRequested => {}
        CancelOutcome::NotFound => {
            return Err(ApiError::NotFound("Workflow not found".to_string()));
        }
        CancelOutcome::IllegalState => {
            return Err(ApiError::Conflict(
                "Workflow already finished".to_string(),
            ));
        }
    }
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workflow not found".to_string()))?;
    Ok(Json(WorkflowResponse {
        id: run.run_id,
        status: run.status(),
        result: run.result.unwrap_or(JsonValue::Object(Default::default())),
    }))
}

// ============================================================================
// Run details (checkpoint trace)
// ============================================================================

#[derive(Debug, Serialize)]
struct RunWrite {
    kind: &'static str,
    channel: String,
    value: JsonValue,
}

#[derive(Debug, Serialize)]
struct RunStep {
    step: u32,
    node: Option<String>,
    task_id: String,
    timestamp: String,
    input_state: JsonValue,
    output_state: JsonValue,
    branches: Vec<String>,
    writes: Vec<RunWrite>,
}

#[derive(Debug, Serialize)]
struct RunDetails {
    run_id: RunId,
    initial_state: JsonValue,
    steps: Vec<RunStep>,
}

fn state_to_json(state: &BTreeMap<String, Value>) -> JsonValue {
    JsonValue::Object(
        state
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

async fn workflow_run_details(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RunDetails>, ApiError> {
    let run_id = parse_run_id(&id)?;
    state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workflow not found".to_string()))?;

    let snapshots = state
        .checkpoints
        .list(run_id.0)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let mut initial_state = JsonValue::Object(Default::default());
    let mut current: BTreeMap<String, Value> = BTreeMap::new();
    let mut steps = Vec::new();

    for snapshot in snapshots {
        if snapshot.superstep == 0 {
            initial_state = state_to_json(&snapshot.channels);
            current = snapshot.channels.clone();
            continue;
        }
        for trace in &snapshot.traces {
            let input_state = state_to_json(&current);
            let mut output_changes = BTreeMap::new();
            let mut writes = Vec::new();
            for write in &trace.writes {
                let kind = match write.kind {
                    WriteKind::State => "state",
                    WriteKind::Branch => "branch",
                    WriteKind::System => "system",
                };
                writes.push(RunWrite {
                    kind,
                    channel: write.channel.clone(),
                    value: write.value.to_json(),
                });
                if write.kind == WriteKind::State {
                    current.insert(write.channel.clone(), write.value.clone());
                    output_changes.insert(write.channel.clone(), write.value.clone());
                }
            }
            steps.push(RunStep {
                step: snapshot.superstep,
                node: Some(trace.node.clone()),
                task_id: trace.task_id.clone(),
                timestamp: snapshot.ts.to_rfc3339(),
                input_state,
                output_state: state_to_json(&output_changes),
                branches: trace.branches.clone(),
                writes,
            });
        }
        // The snapshot's channel map is authoritative at the boundary.
        current = snapshot.channels.clone();
    }

    Ok(Json(RunDetails {
        run_id,
        initial_state,
        steps,
    }))
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Debug, Serialize)]
struct TriggerResponse {
    id: TriggerId,
    name: String,
    template_name: String,
    cron_expression: String,
    timezone: String,
    inputs_template: JsonValue,
    is_active: bool,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TriggerResponse {
    fn from_trigger(trigger: WorkflowTrigger) -> Self {
        Self {
            id: trigger.trigger_id,
            name: trigger.name,
            template_name: trigger.template_name,
            cron_expression: trigger.cron_expression,
            timezone: trigger.timezone,
            inputs_template: trigger.inputs_template,
            is_active: trigger.is_active,
            next_run_at: trigger.next_run_at,
            last_run_at: trigger.last_run_at,
            last_error: trigger.last_error,
            created_at: trigger.created_at,
            updated_at: trigger.updated_at,
        }
    }
}

async fn list_triggers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<TriggerResponse>>, ApiError> {
    let triggers = state.db.list_triggers().await?;
    Ok(Json(
        triggers
            .into_iter()
            .map(TriggerResponse::from_trigger)
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct TriggerCreateRequest {
    name: String,
    template_name: String,
    cron_expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    inputs_template: JsonValue,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

async fn create_trigger(
    State(state): State<ApiState>,
    Json(request): Json<TriggerCreateRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let template = state
        .templates
        .find(&request.template_name)
        .ok_or_else(|| ApiError::NotFound("Template not found".to_string()))?;

    let inputs_template = match &request.inputs_template {
        JsonValue::Null => JsonValue::Object(Default::default()),
        JsonValue::Object(_) => request.inputs_template.clone(),
        _ => {
            return Err(ApiError::BadRequest(
                "inputs_template must be a JSON object".to_string(),
            ));
        }
    };

    validate_schedule(&request.cron_expression, &request.timezone)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let next_run_at = if request.is_active {
        Some(
            first_fire(&request.cron_expression, &request.timezone)
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        )
    } else {
        None
    };

    let trigger = state
        .db
        .create_trigger(&NewTrigger {
            name: request.name,
            template_name: template.id,
            inputs_template,
            cron_expression: request.cron_expression,
            timezone: request.timezone,
            is_active: request.is_active,
            next_run_at,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse::from_trigger(trigger)),
    ))
}

#[derive(Debug, Deserialize)]
struct TriggerUpdateRequest {
    name: Option<String>,
    template_name: Option<String>,
    cron_expression: Option<String>,
    timezone: Option<String>,
    inputs_template: Option<JsonValue>,
    is_active: Option<bool>,
}

async fn update_trigger(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerUpdateRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let trigger_id = parse_trigger_id(&id)?;
    let current = state
        .db
        .get_trigger(trigger_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Trigger not found".to_string()))?;

    let template_name = if let Some(name) = &request.template_name {
        let template = state
            .templates
            .find(name)
            .ok_or_else(|| ApiError::NotFound("Template not found".to_string()))?;
        Some(template.id)
    } else {
        None
    };

    let cron_expression = request
        .cron_expression
        .clone()
        .unwrap_or_else(|| current.cron_expression.clone());
    let timezone = request
        .timezone
        .clone()
        .unwrap_or_else(|| current.timezone.clone());
    let is_active = request.is_active.unwrap_or(current.is_active);

    // Re-activating (or changing the schedule of) an active trigger
    // recomputes its next fire; pausing clears it.
    let next_run_at = if is_active {
        validate_schedule(&cron_expression, &timezone)
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        Some(Some(
            first_fire(&cron_expression, &timezone)
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ))
    } else {
        Some(None)
    };

    if let Some(inputs) = &request.inputs_template
        && !inputs.is_object()
    {
        return Err(ApiError::BadRequest(
            "inputs_template must be a JSON object".to_string(),
        ));
    }

    let patch = TriggerPatch {
        name: request.name,
        template_name,
        inputs_template: request.inputs_template,
        cron_expression: request.cron_expression,
        timezone: request.timezone,
        is_active: request.is_active,
        next_run_at,
        last_error: Some(None),
    };
    let updated = state
        .db
        .update_trigger(trigger_id, &patch)
        .await?
        .ok_or_else(|| ApiError::NotFound("Trigger not found".to_string()))?;
    Ok(Json(TriggerResponse::from_trigger(updated)))
}

async fn delete_trigger(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let trigger_id = parse_trigger_id(&id)?;
    if state.db.delete_trigger(trigger_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("Trigger not found".to_string()))
    }
}

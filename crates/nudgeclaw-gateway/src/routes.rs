//! API route handlers for the gateway.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use nudgeclaw_core::error::NudgeClawError;
use nudgeclaw_scheduler::{NewTask, NotifyTarget, ScheduledTask, TaskPayload, after_ms, after_secs};
use serde::Deserialize;
use serde_json::{Value, json};

use super::server::AppState;

/// Error response: `{"ok": false, "error": ...}` with a status per error kind.
pub struct ApiError(NudgeClawError);

impl From<NudgeClawError> for ApiError {
    fn from(e: NudgeClawError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NudgeClawError::Validation(_) | NudgeClawError::Json(_) => StatusCode::BAD_REQUEST,
            NudgeClawError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            NudgeClawError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ API error: {}", self.0);
        }
        (status, Json(json!({"ok": false, "error": self.0.to_string()}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn task_json(task: &ScheduledTask) -> Value {
    let (kind, data) = task
        .payload
        .to_parts()
        .unwrap_or_else(|_| (task.payload.kind_name().to_string(), Value::Null));
    json!({
        "id": task.id,
        "owner_id": task.owner_id,
        "kind": kind,
        "data": data,
        "next_run_at": task.next_run_at,
        "interval_ms": task.interval_ms,
        "last_run_at": task.last_run_at,
        "locked": !task.is_lockable(Utc::now()),
        "failure_count": task.failure_count,
        "created_at": task.created_at,
    })
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "nudgeclaw-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Cron trigger: run one dispatch cycle and return its report.
pub async fn run_scheduler(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.service.run_once().await?;
    Ok(Json(json!({"ok": true, "report": report})))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
) -> ApiResult {
    let tasks = state.service.manager.list_by_owner(&owner).await?;
    let tasks: Vec<Value> = tasks.iter().map(task_json).collect();
    Ok(Json(json!({"ok": true, "count": tasks.len(), "tasks": tasks})))
}

/// Body for `POST /owners/{owner}/tasks`.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// Absolute due time; wins over `delay_secs`.
    pub next_run_at: Option<DateTime<Utc>>,
    pub delay_secs: Option<i64>,
    pub interval_ms: Option<u64>,
}

impl CreateTaskRequest {
    fn into_new_task(self, owner: &str) -> Result<NewTask, NudgeClawError> {
        let payload = TaskPayload::from_parts(&self.kind, self.data)?;
        let now = Utc::now();
        let next_run_at = match (self.next_run_at, self.delay_secs, self.interval_ms) {
            (Some(at), _, _) => Some(at),
            (None, Some(secs), _) => Some(after_secs(now, secs)?),
            (None, None, Some(ms)) => Some(after_ms(now, ms)?),
            (None, None, None) => None,
        };
        Ok(NewTask {
            owner_id: owner.to_string(),
            payload,
            next_run_at,
            interval_ms: self.interval_ms,
        })
    }
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult {
    let task = state
        .service
        .manager
        .create(body.into_new_task(&owner)?)
        .await?;
    Ok(Json(json!({"ok": true, "task": task_json(&task)})))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.service.manager.delete(&id).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnableRequest {
    #[serde(default)]
    pub locale: Option<String>,
    /// Also schedule escalating nudges (default true).
    #[serde(default)]
    pub nudges: Option<bool>,
}

pub async fn enable_notifications(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult {
    // The body is optional; an empty request enables everything.
    let body: EnableRequest = if body.is_empty() {
        EnableRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(NudgeClawError::from)?
    };
    let manager = &state.service.manager;
    let daily = manager.enable_daily_check(&owner).await?;
    let nudge = if body.nudges.unwrap_or(true) {
        Some(manager.enable_nudges(&owner, body.locale).await?)
    } else {
        None
    };
    Ok(Json(json!({
        "ok": true,
        "daily_check": task_json(&daily),
        "nudge": nudge.as_ref().map(task_json),
    })))
}

pub async fn disable_notifications(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
) -> ApiResult {
    let removed = state.service.manager.disable_notifications(&owner).await?;
    Ok(Json(json!({"ok": true, "removed": removed})))
}

/// Link (or replace) the owner's delivery channel.
pub async fn link_channel(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
    Json(target): Json<NotifyTarget>,
) -> ApiResult {
    state.service.db.link_channel(&owner, &target)?;
    Ok(Json(json!({"ok": true, "channel": target.label()})))
}

pub async fn unlink_channel(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
) -> ApiResult {
    let removed = state.service.db.unlink_channel(&owner)?;
    Ok(Json(json!({"ok": removed})))
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "api".into()
}

/// Record an inbound user message; resets the unanswered-nudge counter.
pub async fn record_message(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
    Json(body): Json<MessageRequest>,
) -> ApiResult {
    state
        .service
        .db
        .record_user_message(&owner, &body.text, &body.source)
        .await?;
    Ok(Json(json!({"ok": true})))
}

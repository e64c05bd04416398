//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{delete, get, post, put},
};
use nudgeclaw_core::config::GatewayConfig;
use nudgeclaw_core::error::Result;
use nudgeclaw_scheduler::SchedulerService;
use tower_http::trace::TraceLayer;

pub const TRIGGER_SECRET_HEADER: &str = "X-Trigger-Secret";

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub service: SchedulerService,
    /// Required in `X-Trigger-Secret` on every `/api/v1` route except health.
    pub trigger_secret: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(service: SchedulerService, trigger_secret: &str) -> Self {
        Self {
            service,
            trigger_secret: Some(trigger_secret.to_string()).filter(|s| !s.is_empty()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Shared-secret auth middleware: validates the X-Trigger-Secret header.
async fn require_trigger_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    // No secret configured: open, as for a local single-user install.
    let Some(expected) = &state.trigger_secret else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(TRIGGER_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        return next.run(req).await;
    }

    tracing::warn!("🚫 Rejected {} {}: bad trigger secret", req.method(), req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing trigger secret"})),
    )
        .into_response()
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let protected = Router::new()
        .route("/api/v1/scheduler/run", post(super::routes::run_scheduler))
        .route(
            "/api/v1/owners/{owner}/tasks",
            get(super::routes::list_tasks).post(super::routes::create_task),
        )
        .route("/api/v1/tasks/{id}", delete(super::routes::delete_task))
        .route(
            "/api/v1/owners/{owner}/notifications/enable",
            post(super::routes::enable_notifications),
        )
        .route(
            "/api/v1/owners/{owner}/notifications/disable",
            post(super::routes::disable_notifications),
        )
        .route(
            "/api/v1/owners/{owner}/channel",
            put(super::routes::link_channel).delete(super::routes::unlink_channel),
        )
        .route(
            "/api/v1/owners/{owner}/messages",
            post(super::routes::record_message),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_trigger_secret,
        ));

    let public = Router::new().route("/api/v1/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until the process is stopped.
pub async fn start_server(config: &GatewayConfig, service: SchedulerService) -> Result<()> {
    if config.trigger_secret.is_empty() {
        tracing::warn!("⚠️ No trigger secret configured, the API is unauthenticated");
    }
    let app = build_router(AppState::new(service, &config.trigger_secret));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

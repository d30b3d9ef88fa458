use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use cn_core::types::{ExternalEvent, LifecycleId, NewTask, Priority, TaskId};

use crate::api_error::ApiError;
use crate::commands::{CoordinatorHandle, NewLifecycle, PlanUpdate};
use crate::event_bus::EventBus;

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    pub handle: CoordinatorHandle,
    pub event_bus: EventBus,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(handle: CoordinatorHandle, event_bus: EventBus) -> Self {
        Self {
            handle,
            event_bus,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the REST + WebSocket router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/state", get(get_state))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/kill-all", post(kill_all))
        .route("/api/agents/{id}/kill", post(kill_agent))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/{name}/rollback", post(rollback_workspace))
        .route("/api/quota", get(get_quota))
        .route("/api/quota/resume", post(resume_quota))
        .route(
            "/api/pr-lifecycles",
            get(list_lifecycles).post(create_lifecycle),
        )
        .route("/api/pr-lifecycles/{id}", delete(delete_lifecycle))
        .route("/api/pr-lifecycles/{id}/approve", post(approve_plan))
        .route("/api/pr-lifecycles/{id}/resume", post(resume_lifecycle))
        .route("/api/events", post(submit_event))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<ApiState>,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, api_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    live_feed_subscribers: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        live_feed_subscribers: state.event_bus.subscriber_count(),
    })
}

async fn get_state(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.snapshot().await?))
}

async fn list_tasks(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.snapshot().await?.tasks))
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title cannot be empty".into()));
    }
    let task = NewTask::new(req.title)
        .with_description(req.description)
        .with_priority(req.priority)
        .with_branch(req.branch)
        .depends_on(req.depends_on)
        .human();
    let created = state.handle.create_task(task).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.handle.snapshot().await?;
    snapshot
        .tasks
        .into_iter()
        .find(|t| t.id == id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))
}

async fn delete_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    state.handle.delete_task(id).await?;
    Ok(Json(serde_json::json!({"status": "deleted", "id": id})))
}

async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.cancel_task(id).await?))
}

async fn list_agents(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.snapshot().await?.agents))
}

async fn kill_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let killed = state.handle.kill_agent(id).await?;
    Ok(Json(serde_json::json!({"id": id, "killed": killed})))
}

async fn kill_all(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let count = state.handle.kill_all().await?;
    Ok(Json(serde_json::json!({"killed": count})))
}

async fn list_workspaces(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.snapshot().await?.workspaces))
}

async fn rollback_workspace(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.rollback_workspace(name).await?))
}

async fn get_quota(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.handle.snapshot().await?;
    Ok(Json(serde_json::json!({
        "quota": snapshot.quota,
        "time_until_reset": snapshot.time_until_reset,
    })))
}

async fn resume_quota(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.resume_quota().await?))
}

async fn list_lifecycles(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.snapshot().await?.lifecycles))
}

async fn create_lifecycle(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewLifecycle>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() || req.branch.trim().is_empty() {
        return Err(ApiError::BadRequest("title and branch are required".into()));
    }
    let created = state.handle.create_lifecycle(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn approve_plan(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<LifecycleId>,
    body: Option<Json<PlanUpdate>>,
) -> Result<impl IntoResponse, ApiError> {
    let update = body.map(|Json(u)| u).unwrap_or_default();
    Ok(Json(state.handle.approve_plan(id, update).await?))
}

async fn resume_lifecycle(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<LifecycleId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.resume_lifecycle(id).await?))
}

async fn delete_lifecycle(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<LifecycleId>,
) -> Result<impl IntoResponse, ApiError> {
    state.handle.delete_lifecycle(id).await?;
    Ok(Json(serde_json::json!({"status": "deleted", "id": id})))
}

/// Webhook ingest. Duplicate deliveries are acknowledged but create nothing.
async fn submit_event(
    State(state): State<Arc<ApiState>>,
    Json(event): Json<ExternalEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if event.id.trim().is_empty() {
        return Err(ApiError::BadRequest("event id cannot be empty".into()));
    }
    let receipt = state.handle.submit_event(event).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

// ---------------------------------------------------------------------------
// WebSocket: /ws live feed with heartbeat
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<ApiState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let rx = state.event_bus.subscribe();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            result = rx.recv_async() => {
                let Ok(msg) = result else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!(error = %e, "skipping unserializable bus message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let ping = serde_json::json!({"type": "ping", "timestamp": chrono::Utc::now().to_rfc3339()});
                if ws_tx.send(Message::Text(ping.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("live feed client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command_channel;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router_without_coordinator() -> Router {
        let (handle, rx) = command_channel();
        drop(rx);
        api_router(Arc::new(ApiState::new(handle, EventBus::new())))
    }

    #[tokio::test]
    async fn empty_title_is_rejected_before_reaching_coordinator() {
        let response = router_without_coordinator()
            .oneshot(
                Request::post("/api/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title":"  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_coordinator_is_503() {
        let response = router_without_coordinator()
            .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn status_reports_version() {
        let response = router_without_coordinator()
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}

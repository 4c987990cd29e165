use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use crate::dispatch::Services;

/// Management surface for operators: health, stability, task CRUD, command
/// execution, plugin status and file cleanup.
pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stability", get(stability))
        .route("/framework/tasks", get(list_tasks).post(create_task))
        .route("/framework/tasks/{id}", delete(delete_task))
        .route("/framework/tasks/{id}/enabled", post(set_task_enabled))
        .route("/framework/tasks/{id}/run", post(run_task))
        .route("/framework/execute", post(execute))
        .route("/plugins", get(plugins))
        .route("/plugins/reload", post(reload_plugins))
        .route("/files/cleanup", post(cleanup_files))
        .with_state(services)
}

pub async fn serve(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = services.config.api.bind_addr.clone();
    let app = router(services);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind management API to {addr}"))?;
    info!("Management API listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("Management API server error")?;
    Ok(())
}

async fn health(State(services): State<Arc<Services>>) -> Json<Value> {
    let connected = services
        .transport
        .check_connectivity(false)
        .await
        .unwrap_or(false);
    let status = if connected { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "connected": connected,
        "uptime_secs": services.uptime_secs(),
    }))
}

async fn stability(State(services): State<Arc<Services>>) -> Json<Value> {
    let snapshot = services.stability.lock().await.snapshot();
    let cfg = &services.config.stability;
    Json(json!({
        "stability": snapshot,
        "heartbeat_interval_secs": cfg.heartbeat_interval_secs,
        "max_reconnect_attempts": cfg.max_reconnect_attempts,
    }))
}

async fn list_tasks(State(services): State<Arc<Services>>) -> Json<Value> {
    let tasks = services.tasks.list().await;
    Json(json!({ "tasks": tasks }))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    time: String,
    command: String,
    #[serde(default)]
    description: String,
}

async fn create_task(
    State(services): State<Arc<Services>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match services
        .tasks
        .add(&req.time, &req.command, &req.description)
        .await
    {
        Ok(task) => Ok(Json(json!({ "task": task }))),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn delete_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if services.tasks.delete(&id).await {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

async fn set_task_enabled(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> Result<Json<Value>, StatusCode> {
    if services.tasks.set_enabled(&id, req.enabled).await {
        Ok(Json(json!({ "id": id, "enabled": req.enabled })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn run_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if services.run_task_now(&id).await {
        Ok(Json(json!({ "ran": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(default)]
    send_back: bool,
}

async fn execute(
    State(services): State<Arc<Services>>,
    Json(req): Json<ExecuteRequest>,
) -> Json<Value> {
    let reply = services.execute_command_text(&req.command).await;
    let mut sent = false;
    if req.send_back {
        if let Some(reply) = &reply {
            sent = services.send_text(reply).await.unwrap_or(false);
        }
    }
    Json(json!({ "reply": reply, "sent": sent }))
}

async fn plugins(State(services): State<Arc<Services>>) -> Json<Value> {
    Json(json!({ "plugins": services.plugins.status().await }))
}

async fn reload_plugins(State(services): State<Arc<Services>>) -> Json<Value> {
    Json(json!({ "plugins": services.plugins.reload().await }))
}

#[derive(Deserialize)]
struct CleanupRequest {
    days: u32,
    #[serde(default)]
    delete_from_disk: bool,
}

async fn cleanup_files(
    State(services): State<Arc<Services>>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match services
        .storage
        .cleanup_old_files(req.days, req.delete_from_disk)
        .await
    {
        Ok(removed) => Ok(Json(json!({ "removed": removed }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", e) })),
        )),
    }
}

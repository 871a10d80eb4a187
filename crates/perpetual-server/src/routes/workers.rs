use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;
use crate::workers::WorkerSession;

#[derive(Deserialize)]
pub struct RegisterBody {
    pub worker_id: String,
    pub instance_id: String,
    pub account_id: String,
}

/// POST /api/workers/register: claim a worker id for this instance.
pub async fn register(
    State(app): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.worker_id.is_empty() || body.instance_id.is_empty() || body.account_id.is_empty() {
        return Err(AppError::bad_request("worker_id, instance_id and account_id are required"));
    }
    app.workers
        .register(&body.worker_id, &body.instance_id, &body.account_id)?;
    Ok(Json(serde_json::json!({
        "worker_id": body.worker_id,
        "heartbeat_interval_secs": app.config.worker.heartbeat_interval_secs,
    })))
}

#[derive(Deserialize)]
pub struct InstanceBody {
    pub worker_id: String,
    pub instance_id: String,
}

/// POST /api/workers/heartbeat
pub async fn heartbeat(
    State(app): State<AppState>,
    Json(body): Json<InstanceBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.workers.heartbeat(&body.worker_id, &body.instance_id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/workers/unregister: release the worker id.
pub async fn unregister(
    State(app): State<AppState>,
    Json(body): Json<InstanceBody>,
) -> Json<serde_json::Value> {
    let released = app.workers.unregister(&body.worker_id, &body.instance_id);
    Json(serde_json::json!({ "ok": released }))
}

/// GET /api/workers
pub async fn list(State(app): State<AppState>) -> Json<Vec<WorkerSession>> {
    Json(app.workers.list())
}

#[derive(Deserialize)]
pub struct TaskQuery {
    pub account_id: String,
    pub instance_id: String,
}

/// GET /api/workers/{worker_id}/tasks: ids of tasks this worker may acquire now.
pub async fn assignable_tasks(
    State(app): State<AppState>,
    Path(worker_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.workers.check(&worker_id, &query.instance_id)?;
    let tasks = app.tasks.clone();
    let ids = tokio::task::spawn_blocking(move || {
        let ids: Vec<String> = tasks
            .assignable(&query.account_id, &worker_id, Utc::now())?
            .into_iter()
            .map(|t| t.id)
            .collect();
        Ok::<_, perpetual_core::PerpetualError>(ids)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "task_ids": ids })))
}

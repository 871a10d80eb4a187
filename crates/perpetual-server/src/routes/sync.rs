use axum::extract::{Path, State};
use axum::Json;
use perpetual_core::sync::{DeploymentEvent, SyncOutcome, SyncTaskDetail};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/sync/deployments: record the releases of a finished deployment.
///
/// May wait on the resource lock, so it runs on the blocking pool.
pub async fn deployment_event(
    State(app): State<AppState>,
    Json(event): Json<DeploymentEvent>,
) -> Result<Json<SyncOutcome>, AppError> {
    let sync = app.sync.clone();
    let outcome = tokio::task::spawn_blocking(move || sync.handle_deployment_event(event))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(outcome))
}

/// GET /api/accounts/{account}/sync/details
pub async fn list_details(
    State(app): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<Vec<SyncTaskDetail>>, AppError> {
    let sync = app.sync.clone();
    let rows = tokio::task::spawn_blocking(move || sync.details().list(&account))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(rows))
}

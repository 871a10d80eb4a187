use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::Json;
use perpetual_core::registry::{PollingInfoForTriggers, SaveOutcome, Subscription, SubscriptionRequest};
use perpetual_core::types::Scope;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/subscriptions/save: join or create a subscription.
pub async fn save(
    State(app): State<AppState>,
    Json(body): Json<SubscriptionRequest>,
) -> Result<Json<SaveOutcome>, AppError> {
    let registry = app.registry.clone();
    let outcome = tokio::task::spawn_blocking(move || registry.save(body))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(outcome))
}

/// POST /api/subscriptions/subscribe: save, or refresh a subscription the
/// caller already holds.
pub async fn subscribe(
    State(app): State<AppState>,
    Json(body): Json<SubscriptionRequest>,
) -> Result<Json<SaveOutcome>, AppError> {
    let registry = app.registry.clone();
    let outcome = tokio::task::spawn_blocking(move || registry.subscribe(body))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct UnsubscribeBody {
    pub account_id: String,
    pub id: String,
    pub signatures: BTreeSet<String>,
}

/// POST /api/subscriptions/unsubscribe: drop signatures from a subscription.
pub async fn unsubscribe(
    State(app): State<AppState>,
    Json(body): Json<UnsubscribeBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let registry = app.registry.clone();
    let found = tokio::task::spawn_blocking(move || {
        registry.unsubscribe(&body.account_id, &body.id, &body.signatures)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "ok": found })))
}

/// GET /api/accounts/{account}/subscriptions
pub async fn list(
    State(app): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<Vec<Subscription>>, AppError> {
    let registry = app.registry.clone();
    let rows = tokio::task::spawn_blocking(move || registry.list(&account))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(rows))
}

/// GET /api/accounts/{account}/subscriptions/{id}
pub async fn get_one(
    State(app): State<AppState>,
    Path((account, id)): Path<(String, String)>,
) -> Result<Json<Subscription>, AppError> {
    let registry = app.registry.clone();
    let lookup = id.clone();
    let row = tokio::task::spawn_blocking(move || registry.get(&account, &lookup))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    row.map(Json)
        .ok_or_else(|| AppError::not_found(format!("subscription '{id}' not found")))
}

#[derive(Deserialize)]
pub struct IdsBody {
    pub ids: Vec<String>,
}

/// POST /api/accounts/{account}/subscriptions/batch: fetch many by id.
pub async fn get_many(
    State(app): State<AppState>,
    Path(account): Path<String>,
    Json(body): Json<IdsBody>,
) -> Result<Json<Vec<Subscription>>, AppError> {
    let registry = app.registry.clone();
    let rows = tokio::task::spawn_blocking(move || registry.get_many(&account, &body.ids))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub struct SignaturesBody {
    pub signatures: BTreeSet<String>,
}

/// POST /api/accounts/{account}/subscriptions/by-signatures: ids owned by
/// any of the given signatures.
pub async fn ids_by_signatures(
    State(app): State<AppState>,
    Path(account): Path<String>,
    Json(body): Json<SignaturesBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let registry = app.registry.clone();
    let ids = tokio::task::spawn_blocking(move || registry.ids_by_signatures(&account, &body.signatures))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "ids": ids })))
}

/// GET /api/accounts/{account}/subscriptions/{id}/triggers
pub async fn polling_info_for_triggers(
    State(app): State<AppState>,
    Path((account, id)): Path<(String, String)>,
) -> Result<Json<PollingInfoForTriggers>, AppError> {
    let registry = app.registry.clone();
    let info = tokio::task::spawn_blocking(move || registry.polling_info_for_triggers(&account, &id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(info))
}

/// POST /api/accounts/{account}/connectors/{connector}/reset: reset every
/// task polling through this connector.
pub async fn reset_connector(
    State(app): State<AppState>,
    Path((account, connector)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let registry = app.registry.clone();
    let reset = tokio::task::spawn_blocking(move || registry.reset_tasks_for_connector(&account, &connector))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

/// POST /api/scopes/delete: drop every subscription at exactly this scope.
pub async fn delete_scope(
    State(app): State<AppState>,
    Json(scope): Json<Scope>,
) -> Result<Json<serde_json::Value>, AppError> {
    scope.validate()?;
    let registry = app.registry.clone();
    let deleted = tokio::task::spawn_blocking(move || registry.delete_at_all_scopes(&scope))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

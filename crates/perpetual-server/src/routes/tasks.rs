use axum::extract::State;
use axum::Json;
use chrono::Utc;
use perpetual_core::batch::DetailBatch;
use perpetual_core::registry::SubscriptionRegistry;
use perpetual_core::sync::{ExecutionStatus, InstanceData, ReleaseIdentifier, SyncReport};
use perpetual_core::task::PerpetualTask;
use perpetual_core::types::PerpetualTaskType;
use perpetual_core::PerpetualError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AcquireBody {
    pub worker_id: String,
    pub worker_instance_id: String,
    pub task_id: String,
    pub account_id: String,
}

/// What a worker receives for an acquired task.
#[derive(Debug, Serialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub task_type: PerpetualTaskType,
    pub account_id: String,
    pub client_context: Value,
    /// Bounded detail rows; instance-sync tasks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<DetailBatch>>,
}

/// POST /api/tasks/acquire: hand a task to a worker.
///
/// Responds with JSON `null` when the task is gone, belongs to another
/// account, or is not assignable to this worker right now. Repeating the
/// call for a task the worker already holds returns the payload again.
pub async fn acquire(
    State(app): State<AppState>,
    Json(body): Json<AcquireBody>,
) -> Result<Json<Option<TaskPayload>>, AppError> {
    app.workers.check(&body.worker_id, &body.worker_instance_id)?;
    let tasks = app.tasks.clone();
    let sync = app.sync.clone();
    let payload = tokio::task::spawn_blocking(move || {
        match tasks.get(&body.task_id)? {
            Some(task) if task.account_id == body.account_id => {}
            _ => return Ok(None),
        }
        let Some(task) = tasks.assign(&body.task_id, &body.worker_id, Utc::now())? else {
            tracing::debug!(task_id = %body.task_id, worker_id = %body.worker_id, "task not assignable");
            return Ok(None);
        };
        let details = match task.task_type {
            PerpetualTaskType::InstanceSync => Some(sync.fetch_task_details(&task.account_id, &task.id)?),
            _ => None,
        };
        tracing::info!(task_id = %task.id, worker_id = %body.worker_id, "task acquired");
        Ok::<_, PerpetualError>(Some(TaskPayload {
            task_id: task.id,
            task_type: task.task_type,
            account_id: task.account_id,
            client_context: task.client_context,
            details,
        }))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(payload))
}

#[derive(Deserialize)]
pub struct ReportBody {
    pub account_id: String,
    pub worker_id: String,
    pub perpetual_task_id: String,
    #[serde(default)]
    pub detail_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Value,
}

/// Result body of an instance-sync run. A single-detail report may carry
/// `releases` with the top-level `detail_id` instead of `instances`.
#[derive(Deserialize, Default)]
struct SyncResult {
    #[serde(default)]
    instances: Vec<InstanceData>,
    #[serde(default)]
    releases: Vec<ReleaseIdentifier>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Result body of a polling run.
#[derive(Deserialize, Default)]
struct PollResult {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    error_message: Option<String>,
}

fn parse_result<T: serde::de::DeserializeOwned + Default>(result: Value) -> Result<T, PerpetualError> {
    if result.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(result).map_err(|e| PerpetualError::validation(format!("malformed result: {e}")))
}

/// POST /api/tasks/report: fold a worker's run result back in.
///
/// `ack` is false when the task no longer exists in this account; the
/// worker drops the result.
pub async fn report(
    State(app): State<AppState>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, AppError> {
    let tasks = app.tasks.clone();
    let sync = app.sync.clone();
    let registry = app.registry.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let task = match tasks.get(&body.perpetual_task_id)? {
            Some(task) if task.account_id == body.account_id => task,
            _ => {
                tracing::warn!(task_id = %body.perpetual_task_id, worker_id = %body.worker_id, "report for unknown task");
                return Ok(serde_json::json!({ "ack": false }));
            }
        };
        tasks.mark_run(&task.id, Utc::now())?;

        match task.task_type {
            PerpetualTaskType::InstanceSync => {
                let parsed: SyncResult = parse_result(body.result)?;
                let mut instances = parsed.instances;
                if let Some(detail_id) = body.detail_id {
                    if !parsed.releases.is_empty() {
                        instances.push(InstanceData {
                            detail_id,
                            releases: parsed.releases,
                        });
                    }
                }
                let report = SyncReport {
                    status: body.status,
                    error_message: parsed.error_message,
                    instances,
                };
                let summary = sync.process_sync_result(&task.account_id, &task.id, &report)?;
                Ok(serde_json::json!({ "ack": true, "summary": summary }))
            }
            _ => {
                let parsed: PollResult = parse_result(body.result)?;
                let ack = apply_poll_result(&registry, &task, body.status, parsed)?;
                Ok::<_, PerpetualError>(serde_json::json!({ "ack": ack }))
            }
        }
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(reply))
}

/// Record a polling run on the subscription behind `task` and forward the
/// outcome to the trigger service.
fn apply_poll_result(
    registry: &SubscriptionRegistry,
    task: &PerpetualTask,
    status: ExecutionStatus,
    result: PollResult,
) -> Result<bool, PerpetualError> {
    let Some(subscription_id) = task.client_context.get("subscription_id").and_then(Value::as_str) else {
        tracing::warn!(task_id = %task.id, "polling task has no subscription in its context");
        return Ok(false);
    };
    let Some(row) = registry.get(&task.account_id, subscription_id)? else {
        tracing::debug!(task_id = %task.id, subscription_id, "subscription gone; dropping poll result");
        return Ok(false);
    };
    let signatures: Vec<String> = row.signatures.iter().cloned().collect();

    match status {
        ExecutionStatus::Success => {
            registry.update_polled_response(&row.scope.account_id, &row.id, result.keys.clone())?;
            if row.failed_attempts > 0 {
                registry.update_failed_attempts(&row.scope.account_id, &row.id, 0)?;
            }
            registry.update_trigger_polling_status(&row.scope.account_id, signatures, true, "", result.keys, None);
        }
        ExecutionStatus::Failure => {
            let attempts = row.failed_attempts.saturating_add(1);
            registry.update_failed_attempts(&row.scope.account_id, &row.id, attempts)?;
            let message = result.error_message.unwrap_or_default();
            tracing::warn!(subscription_id = %row.id, attempts, error = %message, "polling run failed");
            registry.update_trigger_polling_status(
                &row.scope.account_id,
                signatures,
                false,
                &message,
                Vec::new(),
                Some(task.schedule.timeout),
            );
        }
    }
    Ok(true)
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Acquire ──────────────────────────────────────────────────────────────

/// Body of an Acquire call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub worker_id: String,
    pub worker_instance_id: String,
    pub task_id: String,
    pub account_id: String,
}

/// An acquired task. Everything past the id is opaque to the agent and is
/// handed to the executor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub task_type: String,
    pub account_id: String,
    #[serde(default)]
    pub client_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

// ─── Report ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
}

/// What an executor produced for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_id: Option<String>,
    #[serde(default)]
    pub result: Value,
}

impl TaskResult {
    pub fn success(result: Value) -> Self {
        Self {
            status: RunStatus::Success,
            detail_id: None,
            result,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            detail_id: None,
            result: serde_json::json!({ "error_message": message.into() }),
        }
    }
}

/// Body of a Report call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub account_id: String,
    pub worker_id: String,
    pub perpetual_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub result: Value,
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use perpetual_core::PerpetualError;

use crate::workers::WorkerError;

// ---------------------------------------------------------------------------
// Internal sentinels for explicit status codes
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

/// Carries an explicit HTTP 404 through the `anyhow::Error` chain.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
///
/// Body is `{"error": "<message>"}`, plus `"code"` when the client is
/// expected to branch on it (worker identity faults).
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

fn core_status(e: &PerpetualError) -> StatusCode {
    match e {
        PerpetualError::Validation(_) => StatusCode::BAD_REQUEST,
        PerpetualError::SubscriptionNotFound(_)
        | PerpetualError::TaskNotFound(_)
        | PerpetualError::DetailNotFound(_) => StatusCode::NOT_FOUND,
        PerpetualError::LockTimeout { .. } => StatusCode::CONFLICT,
        PerpetualError::Store(_)
        | PerpetualError::Scheduler(_)
        | PerpetualError::Io(_)
        | PerpetualError::Yaml(_)
        | PerpetualError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(e) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": e.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
        if let Some(e) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": e.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }
        if let Some(e) = self.0.downcast_ref::<WorkerError>() {
            let (status, code) = match e {
                WorkerError::Duplicate(_) => (StatusCode::CONFLICT, "DUPLICATE_WORKER"),
                WorkerError::NotRegistered(_) => (StatusCode::NOT_FOUND, "NOT_REGISTERED"),
            };
            let body = serde_json::json!({ "error": e.to_string(), "code": code });
            return (status, axum::Json(body)).into_response();
        }

        let status = match self.0.downcast_ref::<PerpetualError>() {
            Some(e) => core_status(e),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

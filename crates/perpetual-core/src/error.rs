use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerpetualError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("perpetual task not found: {0}")]
    TaskNotFound(String),

    #[error("sync task detail not found: {0}")]
    DetailNotFound(String),

    #[error("timed out waiting for lock on {resource}")]
    LockTimeout { resource: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PerpetualError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Map any redb error into `PerpetualError::Store`.
///
/// redb splits its failures across several error types (transaction, table,
/// storage, commit); all of them end up here.
pub(crate) fn db_err(e: impl std::fmt::Display) -> PerpetualError {
    PerpetualError::Store(e.to_string())
}

pub type Result<T> = std::result::Result<T, PerpetualError>;

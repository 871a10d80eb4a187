use serde_json::Value;

use crate::error::Result;
use crate::types::{PerpetualTaskType, Schedule};

/// Contract of the service that owns perpetual task records.
///
/// The directory and the sync store only ever go through this trait, so the
/// record store can live in-process ([`TaskDb`](crate::task::TaskDb)) or
/// behind a remote API.
pub trait PerpetualTaskScheduler: Send + Sync {
    /// Create a task and return its id.
    fn create_perpetual_task(
        &self,
        account_id: &str,
        task_type: PerpetualTaskType,
        schedule: Schedule,
        client_context: &Value,
    ) -> Result<String>;

    /// Keep the id, refresh the schedule and replace the context when one is
    /// given. Clears any worker assignment so the next pull sees the change.
    fn reset_perpetual_task(
        &self,
        account_id: &str,
        task_id: &str,
        client_context: Option<&Value>,
    ) -> Result<()>;

    /// Returns false if the task did not exist.
    fn delete_task(&self, account_id: &str, task_id: &str) -> Result<bool>;
}

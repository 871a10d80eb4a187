use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PerpetualTaskType, Schedule};

/// A recurring job dispatched to worker agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualTask {
    pub id: String,
    pub task_type: PerpetualTaskType,
    pub schedule: Schedule,
    /// Opaque input handed to the worker that runs the task.
    #[serde(default)]
    pub client_context: Value,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl PerpetualTask {
    /// Never run, or a full interval has passed since the last run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => elapsed(last, self.schedule.interval, now),
        }
    }

    /// Due, and either free, already ours, or held by a worker whose lease
    /// (`schedule.timeout`) has lapsed.
    pub fn is_assignable_to(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled || !self.is_due(now) {
            return false;
        }
        match (&self.assigned_worker, self.assigned_at) {
            (None, _) => true,
            (Some(w), _) if w == worker_id => true,
            (Some(_), Some(at)) => elapsed(at, self.schedule.timeout, now),
            (Some(_), None) => true,
        }
    }
}

/// `since + span <= now`; an unrepresentable span never elapses.
fn elapsed(since: DateTime<Utc>, span: std::time::Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| since.checked_add_signed(d))
        .is_some_and(|deadline| deadline <= now)
}

//! Live worker sessions, one per worker id.
//!
//! A worker id may only have one live instance at a time. A second instance
//! registering while the first still heartbeats is refused with
//! `DUPLICATE_WORKER`; the agent treats that as fatal and self-destructs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {0} already has a live instance")]
    Duplicate(String),

    #[error("worker {0} is not registered")]
    NotRegistered(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSession {
    pub worker_id: String,
    pub instance_id: String,
    pub account_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

pub struct WorkerRegistry {
    sessions: Mutex<HashMap<String, WorkerSession>>,
    heartbeat_timeout: chrono::Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or(chrono::Duration::days(1)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self, session: &WorkerSession, now: DateTime<Utc>) -> bool {
        now - session.last_heartbeat <= self.heartbeat_timeout
    }

    /// Claim the worker id for `instance_id`. Re-registering the same
    /// instance is a refresh; a stale session from another instance is
    /// replaced.
    pub fn register(&self, worker_id: &str, instance_id: &str, account_id: &str) -> Result<(), WorkerError> {
        let now = Utc::now();
        let mut sessions = self.lock();
        if let Some(current) = sessions.get(worker_id) {
            if current.instance_id != instance_id && self.is_live(current, now) {
                tracing::warn!(worker_id, instance_id, live = %current.instance_id, "duplicate worker registration refused");
                return Err(WorkerError::Duplicate(worker_id.to_string()));
            }
        }
        sessions.insert(
            worker_id.to_string(),
            WorkerSession {
                worker_id: worker_id.to_string(),
                instance_id: instance_id.to_string(),
                account_id: account_id.to_string(),
                registered_at: now,
                last_heartbeat: now,
            },
        );
        tracing::info!(worker_id, instance_id, account = account_id, "worker registered");
        Ok(())
    }

    /// Confirm `instance_id` owns `worker_id` without touching the session.
    pub fn check(&self, worker_id: &str, instance_id: &str) -> Result<(), WorkerError> {
        match self.lock().get(worker_id) {
            None => Err(WorkerError::NotRegistered(worker_id.to_string())),
            Some(s) if s.instance_id != instance_id => Err(WorkerError::Duplicate(worker_id.to_string())),
            Some(_) => Ok(()),
        }
    }

    pub fn heartbeat(&self, worker_id: &str, instance_id: &str) -> Result<(), WorkerError> {
        let mut sessions = self.lock();
        match sessions.get_mut(worker_id) {
            None => Err(WorkerError::NotRegistered(worker_id.to_string())),
            Some(s) if s.instance_id != instance_id => Err(WorkerError::Duplicate(worker_id.to_string())),
            Some(s) => {
                s.last_heartbeat = Utc::now();
                Ok(())
            }
        }
    }

    /// Release the slot. Only the owning instance may do so.
    pub fn unregister(&self, worker_id: &str, instance_id: &str) -> bool {
        let mut sessions = self.lock();
        let owned = sessions
            .get(worker_id)
            .is_some_and(|s| s.instance_id == instance_id);
        if owned {
            sessions.remove(worker_id);
            tracing::info!(worker_id, instance_id, "worker unregistered");
        }
        owned
    }

    pub fn list(&self) -> Vec<WorkerSession> {
        let mut all: Vec<WorkerSession> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }
}

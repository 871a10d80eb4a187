use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::identity::WorkerIdentity;
use crate::lifecycle::Lifecycle;
use crate::transport::ControlPlane;
use crate::types::{AcquireRequest, TaskPayload};
use crate::Result;

/// Result of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(TaskPayload),
    /// Retries exhausted on transport faults or empty bodies.
    NoWork,
    /// Not attempted: acquisition is switched off, or this task id is
    /// already being acquired by this process. No network call was made.
    Denied,
}

/// Pulls tasks from the control plane with local dedup and a bounded retry.
///
/// The in-flight set only suppresses duplicate pulls inside this process;
/// the control plane handles duplicates across workers.
pub struct TaskAcquirer {
    transport: Arc<dyn ControlPlane>,
    identity: Arc<WorkerIdentity>,
    lifecycle: Arc<Lifecycle>,
    in_flight: Mutex<HashSet<String>>,
    max_attempts: u32,
}

/// Removes its task id from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, task_id: &str) -> Option<Self> {
        if !lock(set).insert(task_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.task_id);
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

impl TaskAcquirer {
    pub fn new(
        transport: Arc<dyn ControlPlane>,
        identity: Arc<WorkerIdentity>,
        lifecycle: Arc<Lifecycle>,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            identity,
            lifecycle,
            in_flight: Mutex::new(HashSet::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        lock(&self.in_flight).contains(task_id)
    }

    /// Acquire `task_id`.
    ///
    /// Transport faults and empty bodies repeat the same request, up to
    /// `max_attempts` in total and with no pause between attempts. Any
    /// other error is returned at once. The in-flight entry is released on
    /// every path.
    pub async fn acquire(&self, task_id: &str) -> Result<AcquireOutcome> {
        if !self.lifecycle.can_acquire() {
            tracing::debug!(task_id, "acquisition disabled");
            return Ok(AcquireOutcome::Denied);
        }
        let Some(_claim) = InFlight::claim(&self.in_flight, task_id) else {
            tracing::debug!(task_id, "task already being acquired");
            return Ok(AcquireOutcome::Denied);
        };

        let request = AcquireRequest {
            worker_id: self.identity.worker_id().to_string(),
            worker_instance_id: self.identity.instance_id().to_string(),
            task_id: task_id.to_string(),
            account_id: self.identity.account_id().to_string(),
        };

        // TODO: add backoff with jitter between attempts once the control
        // plane can absorb the extra latency on Acquire.
        for attempt in 1..=self.max_attempts {
            match self.transport.acquire(&request).await {
                Ok(payload) => {
                    tracing::debug!(task_id, attempt, "task acquired");
                    return Ok(AcquireOutcome::Acquired(payload));
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(task_id, attempt, error = %e, "acquire attempt failed");
                }
                Err(e) => {
                    self.lifecycle.observe(&e);
                    return Err(e);
                }
            }
        }
        tracing::info!(task_id, attempts = self.max_attempts, "no task after retries");
        Ok(AcquireOutcome::NoWork)
    }
}

use uuid::Uuid;

/// Who this process is, as seen by the control plane.
///
/// Built once at startup and passed to every component that talks to the
/// control plane. `instance_id` and `connection_id` are fresh per process, so
/// a restarted worker with the same `worker_id` is a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    worker_id: String,
    instance_id: String,
    connection_id: String,
    account_id: String,
}

impl WorkerIdentity {
    pub fn new(worker_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            instance_id: Uuid::new_v4().to_string(),
            connection_id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
        }
    }

    /// Reuse a known instance id, e.g. one persisted across a hot restart.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

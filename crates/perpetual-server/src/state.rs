use std::path::Path;
use std::sync::Arc;

use perpetual_core::config::Config;
use perpetual_core::lock::ResourceLocker;
use perpetual_core::registry::{
    LoggingTriggerSink, SubscriptionDb, SubscriptionRegistry, TriggerStatusSink,
};
use perpetual_core::store::Store;
use perpetual_core::sync::{SyncDetailDb, SyncTaskService};
use perpetual_core::task::{PerpetualTaskDirectory, TaskDb};

use crate::auth::WorkerAuth;
use crate::trigger::HttpTriggerSink;
use crate::workers::WorkerRegistry;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SubscriptionRegistry>,
    pub tasks: TaskDb,
    pub sync: Arc<SyncTaskService>,
    pub workers: Arc<WorkerRegistry>,
    pub auth: Arc<WorkerAuth>,
}

impl AppState {
    /// Open (or create) the control-plane database at `db_path` and wire the
    /// registry, task directory and sync service over it.
    pub fn open(db_path: &Path, config: Config) -> anyhow::Result<Self> {
        let store = Store::open(db_path)?;
        let subscriptions = SubscriptionDb::new(store.clone())?;
        let tasks = TaskDb::new(store.clone())?;
        let locker = ResourceLocker::new(store.clone(), &config.lock)?;

        let directory = PerpetualTaskDirectory::new(Arc::new(tasks.clone()), subscriptions.clone());
        let registry = SubscriptionRegistry::new(subscriptions, config.polled_keys_limit)
            .with_observer(Arc::new(directory))
            .with_trigger_sink(trigger_sink(&config));

        let sync = SyncTaskService::new(
            SyncDetailDb::new(store)?,
            Arc::new(tasks.clone()),
            locker,
            config.lock.clone(),
            config.batch.clone(),
        );

        let auth = WorkerAuth::new(&config.worker_tokens);
        if auth.is_open() {
            tracing::warn!("no worker tokens configured; worker routes are unauthenticated");
        }

        Ok(Self {
            workers: Arc::new(WorkerRegistry::new(config.worker.heartbeat_timeout())),
            registry: Arc::new(registry),
            tasks,
            sync: Arc::new(sync),
            auth: Arc::new(auth),
            config: Arc::new(config),
        })
    }
}

/// HTTP sink when a trigger service is configured and a runtime is
/// available to drive it; logging sink otherwise.
fn trigger_sink(config: &Config) -> Arc<dyn TriggerStatusSink> {
    match &config.triggers_url {
        Some(url) if tokio::runtime::Handle::try_current().is_ok() => {
            Arc::new(HttpTriggerSink::spawn(url.clone()))
        }
        Some(url) => {
            tracing::warn!(url = %url, "no async runtime; trigger status will only be logged");
            Arc::new(LoggingTriggerSink)
        }
        None => Arc::new(LoggingTriggerSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_wires_an_empty_control_plane() {
        let dir = TempDir::new().unwrap();
        let state = AppState::open(&dir.path().join("cp.redb"), Config::default()).unwrap();
        assert!(state.registry.list("acct").unwrap().is_empty());
        assert!(state.tasks.list("acct").unwrap().is_empty());
        assert!(state.auth.is_open());
    }

    #[test]
    fn triggers_url_without_runtime_falls_back_to_logging() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            triggers_url: Some("http://triggers.invalid/status".into()),
            ..Config::default()
        };
        assert!(AppState::open(&dir.path().join("cp.redb"), config).is_ok());
    }
}

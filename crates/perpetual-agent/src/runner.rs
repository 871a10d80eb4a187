use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::acquire::{AcquireOutcome, TaskAcquirer};
use crate::executor::TaskExecutor;
use crate::identity::WorkerIdentity;
use crate::lifecycle::Lifecycle;
use crate::transport::ControlPlane;
use crate::types::{TaskPayload, TaskReport, TaskResult};
use crate::Result;

// ─── RunnerConfig ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_concurrent_tasks: usize,
    pub max_acquire_attempts: u32,
    /// Release the worker id after a clean shutdown.
    pub unregister_on_shutdown: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(15 * 60),
            max_concurrent_tasks: 8,
            max_acquire_attempts: 3,
            unregister_on_shutdown: true,
        }
    }
}

/// Why [`WorkerRunner::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown requested; in-flight work drained.
    Shutdown,
    /// Identity fault; in-flight work aborted and transport closed.
    SelfDestructed,
}

// ─── WorkerRunner ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct Shared {
    transport: Arc<dyn ControlPlane>,
    identity: Arc<WorkerIdentity>,
    lifecycle: Arc<Lifecycle>,
    acquirer: Arc<TaskAcquirer>,
    executor: Arc<dyn TaskExecutor>,
    /// Task ids acquired and not yet reported.
    running: Arc<Mutex<HashSet<String>>>,
}

/// Drives one worker: register, then heartbeat and pull until shutdown or
/// self-destruct.
///
/// Each pulled task id runs acquire → execute → report in its own Tokio
/// task, bounded by a semaphore of `max_concurrent_tasks` permits.
pub struct WorkerRunner {
    shared: Shared,
    config: RunnerConfig,
}

/// Clears a task id from the running set when dropped.
struct Running {
    set: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.task_id);
        }
    }
}

impl WorkerRunner {
    pub fn new(
        transport: Arc<dyn ControlPlane>,
        identity: WorkerIdentity,
        executor: Arc<dyn TaskExecutor>,
        config: RunnerConfig,
    ) -> Self {
        let identity = Arc::new(identity);
        let lifecycle = Arc::new(Lifecycle::new(transport.clone(), config.heartbeat_timeout));
        let acquirer = Arc::new(TaskAcquirer::new(
            transport.clone(),
            identity.clone(),
            lifecycle.clone(),
            config.max_acquire_attempts,
        ));
        Self {
            shared: Shared {
                transport,
                identity,
                lifecycle,
                acquirer,
                executor,
                running: Arc::new(Mutex::new(HashSet::new())),
            },
            config,
        }
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.shared.lifecycle.clone()
    }

    /// Run until `shutdown` resolves or the lifecycle self-destructs.
    ///
    /// Shutdown stops new pulls and waits for every in-flight task to finish,
    /// with no upper bound, before unregistering.
    pub async fn run<F>(self, shutdown: F) -> Result<WorkerExit>
    where
        F: Future<Output = ()>,
    {
        let shared = &self.shared;
        if let Err(e) = shared.transport.register(&shared.identity).await {
            shared.lifecycle.observe(&e);
            return Err(e);
        }
        shared.lifecycle.record_heartbeat(Utc::now());
        tracing::info!(
            worker_id = shared.identity.worker_id(),
            instance_id = shared.identity.instance_id(),
            "worker registered"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut terminate = shared.lifecycle.subscribe();

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        tokio::pin!(shutdown);
        let exit = loop {
            if *terminate.borrow() {
                break WorkerExit::SelfDestructed;
            }
            tokio::select! {
                _ = &mut shutdown => break WorkerExit::Shutdown,
                changed = terminate.changed() => {
                    if changed.is_err() {
                        break WorkerExit::SelfDestructed;
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = poll.tick() => self.poll_once(&permits, &mut tasks).await,
                Some(joined) = tasks.join_next() => reap(joined),
            }
        };

        match exit {
            WorkerExit::SelfDestructed => {
                tracing::error!(in_flight = tasks.len(), "self-destruct: aborting in-flight tasks");
                tasks.shutdown().await;
            }
            WorkerExit::Shutdown => {
                shared.lifecycle.begin_shutdown();
                tracing::info!(in_flight = tasks.len(), "draining in-flight tasks");
                while let Some(joined) = tasks.join_next().await {
                    reap(joined);
                }
                if self.config.unregister_on_shutdown {
                    match shared.transport.unregister(&shared.identity).await {
                        Ok(released) => tracing::info!(released, "worker unregistered"),
                        Err(e) => tracing::warn!(error = %e, "unregister failed"),
                    }
                }
            }
        }
        Ok(exit)
    }

    async fn heartbeat(&self) {
        let shared = &self.shared;
        match shared.transport.heartbeat(&shared.identity).await {
            Ok(()) => shared.lifecycle.record_heartbeat(Utc::now()),
            Err(e) if e.is_not_registered() => {
                tracing::warn!("control plane lost this worker; registering again");
                match shared.transport.register(&shared.identity).await {
                    Ok(()) => shared.lifecycle.record_heartbeat(Utc::now()),
                    Err(e) => {
                        if !shared.lifecycle.observe(&e) {
                            tracing::warn!(error = %e, "re-register failed");
                        }
                    }
                }
            }
            Err(e) => {
                if !shared.lifecycle.observe(&e) {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        }
    }

    async fn poll_once(&self, permits: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        let shared = &self.shared;
        if !shared.lifecycle.can_acquire() {
            return;
        }
        let ids = match shared.transport.list_tasks(&shared.identity).await {
            Ok(ids) => ids,
            Err(e) => {
                if !shared.lifecycle.observe(&e) {
                    tracing::warn!(error = %e, "listing tasks failed");
                }
                return;
            }
        };

        for task_id in ids {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                tracing::debug!("executor pool full; waiting for next poll");
                break;
            };
            let claimed = match shared.running.lock() {
                Ok(mut running) => running.insert(task_id.clone()),
                Err(_) => false,
            };
            if !claimed {
                continue;
            }
            let guard = Running {
                set: shared.running.clone(),
                task_id: task_id.clone(),
            };
            let shared = shared.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                shared.run_task(&task_id).await;
            });
        }
    }
}

impl Shared {
    async fn run_task(&self, task_id: &str) {
        let payload = match self.acquirer.acquire(task_id).await {
            Ok(AcquireOutcome::Acquired(payload)) => payload,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "acquire failed");
                return;
            }
        };
        let result = match self.executor.execute(payload.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "task execution failed");
                TaskResult::failure(e.to_string())
            }
        };
        self.report(&payload, result).await;
    }

    /// Best-effort: failures are logged and reported as `false`.
    async fn report(&self, payload: &TaskPayload, result: TaskResult) -> bool {
        let report = TaskReport {
            account_id: payload.account_id.clone(),
            worker_id: self.identity.worker_id().to_string(),
            perpetual_task_id: payload.task_id.clone(),
            detail_id: result.detail_id,
            status: result.status,
            result: result.result,
        };
        match self.transport.report(&report).await {
            Ok(ack) => {
                if !ack {
                    tracing::debug!(task_id = %payload.task_id, "report not acknowledged");
                }
                ack
            }
            Err(e) => {
                self.lifecycle.observe(&e);
                tracing::warn!(task_id = %payload.task_id, error = %e, "report failed");
                false
            }
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "task runner panicked");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

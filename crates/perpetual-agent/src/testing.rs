//! In-process [`ControlPlane`] double for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{AgentError, AuthFault};
use crate::identity::WorkerIdentity;
use crate::transport::ControlPlane;
use crate::types::{AcquireRequest, TaskPayload, TaskReport};
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum Behavior {
    #[default]
    Ok,
    Transport,
    Empty,
    Auth(AuthFault),
    NotRegistered,
    Protocol,
}

impl Behavior {
    fn error(self) -> Option<AgentError> {
        match self {
            Self::Ok => None,
            Self::Transport => Some(AgentError::Transport("connection reset".into())),
            Self::Empty => Some(AgentError::EmptyResponse),
            Self::Auth(fault) => Some(AgentError::Auth(fault)),
            Self::NotRegistered => Some(AgentError::Protocol {
                status: 404,
                code: Some("NOT_REGISTERED".into()),
                message: "not registered".into(),
            }),
            Self::Protocol => Some(AgentError::Protocol {
                status: 500,
                code: None,
                message: "boom".into(),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeControlPlane {
    closed: AtomicBool,
    pub acquire_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub heartbeat_calls: AtomicUsize,
    pub unregister_calls: AtomicUsize,
    pub reports: Mutex<Vec<TaskReport>>,
    pub acquire: Mutex<Behavior>,
    pub heartbeat: Mutex<Behavior>,
    pub tasks: Mutex<Vec<String>>,
    pub acquire_delay: Mutex<Duration>,
}

impl FakeControlPlane {
    pub fn with_tasks(ids: &[&str]) -> Self {
        let fake = Self::default();
        *fake.tasks.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        fake
    }

    pub fn set_acquire(&self, behavior: Behavior) {
        *self.acquire.lock().unwrap() = behavior;
    }

    pub fn set_heartbeat(&self, behavior: Behavior) {
        *self.heartbeat.lock().unwrap() = behavior;
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = delay;
    }

    pub fn acquire_count(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::Closed);
        }
        Ok(())
    }
}

impl ControlPlane for FakeControlPlane {
    fn register<'a>(&'a self, _identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn heartbeat<'a>(&'a self, _identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.heartbeat.lock().unwrap();
            match behavior.error() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn list_tasks<'a>(&'a self, _identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            self.check_open()?;
            Ok(self.tasks.lock().unwrap().clone())
        })
    }

    fn acquire<'a>(&'a self, request: &'a AcquireRequest) -> BoxFuture<'a, Result<TaskPayload>> {
        Box::pin(async move {
            self.check_open()?;
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.acquire_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let behavior = *self.acquire.lock().unwrap();
            if let Some(e) = behavior.error() {
                return Err(e);
            }
            Ok(TaskPayload {
                task_id: request.task_id.clone(),
                task_type: "ARTIFACT_COLLECTION".into(),
                account_id: request.account_id.clone(),
                client_context: serde_json::json!({ "subscription_id": "sub-1" }),
                details: None,
            })
        })
    }

    fn report<'a>(&'a self, report: &'a TaskReport) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.check_open()?;
            self.reports.lock().unwrap().push(report.clone());
            Ok(true)
        })
    }

    fn unregister<'a>(&'a self, _identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.check_open()?;
            self.unregister_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

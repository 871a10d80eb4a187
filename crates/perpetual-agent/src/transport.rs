use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, AuthFault};
use crate::identity::WorkerIdentity;
use crate::types::{AcquireRequest, TaskPayload, TaskReport};
use crate::Result;

// ─── ControlPlane ─────────────────────────────────────────────────────────

/// The network calls a worker makes. Every call fails with
/// [`AgentError::Closed`] once [`ControlPlane::close`] has been called.
pub trait ControlPlane: Send + Sync {
    fn register<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>>;

    fn heartbeat<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>>;

    /// Ids of tasks this worker may acquire right now.
    fn list_tasks<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<Vec<String>>>;

    /// One Acquire call. An empty or `null` body is [`AgentError::EmptyResponse`].
    fn acquire<'a>(&'a self, request: &'a AcquireRequest) -> BoxFuture<'a, Result<TaskPayload>>;

    /// Returns the control plane's ack.
    fn report<'a>(&'a self, report: &'a TaskReport) -> BoxFuture<'a, Result<bool>>;

    fn unregister<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<bool>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

// ─── HttpControlPlane ─────────────────────────────────────────────────────

/// [`ControlPlane`] over the control plane's JSON HTTP API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    closed: AtomicBool,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Serialize)]
struct InstanceBody<'a> {
    worker_id: &'a str,
    instance_id: &'a str,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    worker_id: &'a str,
    instance_id: &'a str,
    account_id: &'a str,
}

#[derive(Deserialize)]
struct TaskIds {
    task_ids: Vec<String>,
}

#[derive(Deserialize)]
struct Ack {
    #[serde(default)]
    ack: bool,
}

#[derive(Deserialize)]
struct Released {
    #[serde(default)]
    ok: bool,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            closed: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        if self.is_closed() {
            return Err(AgentError::Closed);
        }
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Err(AgentError::EmptyResponse);
        }
        let value: Value = serde_json::from_str(&text)?;
        if value.is_null() {
            return Err(AgentError::EmptyResponse);
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }
}

/// Turn a non-2xx response into an error. Identity faults carry a code the
/// lifecycle acts on; everything else is a protocol error.
fn classify(status: u16, body: &str) -> AgentError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (message, code) = match parsed {
        Some(b) => (b.error, b.code),
        None => (body.to_string(), None),
    };
    if matches!(status, 401 | 409) {
        if let Some(fault) = code.as_deref().and_then(AuthFault::from_code) {
            return AgentError::Auth(fault);
        }
    }
    AgentError::Protocol { status, code, message }
}

impl ControlPlane for HttpControlPlane {
    fn register<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = RegisterBody {
                worker_id: identity.worker_id(),
                instance_id: identity.instance_id(),
                account_id: identity.account_id(),
            };
            let _: Value = self.post("/api/workers/register", &body).await?;
            Ok(())
        })
    }

    fn heartbeat<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = InstanceBody {
                worker_id: identity.worker_id(),
                instance_id: identity.instance_id(),
            };
            let _: Value = self.post("/api/workers/heartbeat", &body).await?;
            Ok(())
        })
    }

    fn list_tasks<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url(&format!("/api/workers/{}/tasks", identity.worker_id())))
                .query(&[
                    ("account_id", identity.account_id()),
                    ("instance_id", identity.instance_id()),
                ]);
            let ids: TaskIds = self.send(request).await?;
            Ok(ids.task_ids)
        })
    }

    fn acquire<'a>(&'a self, request: &'a AcquireRequest) -> BoxFuture<'a, Result<TaskPayload>> {
        Box::pin(async move { self.post("/api/tasks/acquire", request).await })
    }

    fn report<'a>(&'a self, report: &'a TaskReport) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let ack: Ack = self.post("/api/tasks/report", report).await?;
            Ok(ack.ack)
        })
    }

    fn unregister<'a>(&'a self, identity: &'a WorkerIdentity) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let body = InstanceBody {
                worker_id: identity.worker_id(),
                instance_id: identity.instance_id(),
            };
            let released: Released = self.post("/api/workers/unregister", &body).await?;
            Ok(released.ok)
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(url = %self.base_url, "control-plane transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn transport(server: &mockito::Server) -> HttpControlPlane {
        HttpControlPlane::new(server.url(), Some("tok".into()), Duration::from_secs(5)).unwrap()
    }

    fn acquire_request() -> AcquireRequest {
        AcquireRequest {
            worker_id: "w1".into(),
            worker_instance_id: "i1".into(),
            task_id: "t1".into(),
            account_id: "acct".into(),
        }
    }

    #[tokio::test]
    async fn acquire_returns_payload_and_sends_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/tasks/acquire")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::PartialJson(serde_json::json!({ "task_id": "t1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"task_id":"t1","task_type":"ARTIFACT_COLLECTION","account_id":"acct","client_context":{"x":1}}"#)
            .create_async()
            .await;

        let payload = transport(&server).acquire(&acquire_request()).await.unwrap();
        assert_eq!(payload.task_id, "t1");
        assert_eq!(payload.client_context["x"], 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn null_body_is_empty_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/tasks/acquire")
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;
        let err = transport(&server).acquire(&acquire_request()).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyResponse));
    }

    #[tokio::test]
    async fn auth_codes_become_faults() {
        let mut server = mockito::Server::new_async().await;
        let _expired = server
            .mock("POST", "/api/workers/heartbeat")
            .with_status(401)
            .with_body(r#"{"error":"unauthorized","code":"EXPIRED_TOKEN"}"#)
            .create_async()
            .await;
        let _duplicate = server
            .mock("POST", "/api/workers/register")
            .with_status(409)
            .with_body(r#"{"error":"worker w1 already has a live instance","code":"DUPLICATE_WORKER"}"#)
            .create_async()
            .await;

        let t = transport(&server);
        let id = WorkerIdentity::new("w1", "acct");
        let err = t.heartbeat(&id).await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(AuthFault::Expired)));
        let err = t.register(&id).await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(AuthFault::Duplicate)));
    }

    #[tokio::test]
    async fn not_registered_is_a_protocol_error_with_code() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/workers/heartbeat")
            .with_status(404)
            .with_body(r#"{"error":"worker w1 is not registered","code":"NOT_REGISTERED"}"#)
            .create_async()
            .await;
        let err = transport(&server)
            .heartbeat(&WorkerIdentity::new("w1", "acct"))
            .await
            .unwrap_err();
        assert!(err.is_not_registered());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn connection_failure_is_transport() {
        let t = HttpControlPlane::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = t.acquire(&acquire_request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn closed_transport_refuses_calls() {
        let server = mockito::Server::new_async().await;
        let t = transport(&server);
        t.close();
        assert!(t.is_closed());
        let err = t.acquire(&acquire_request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Closed));
    }

    #[tokio::test]
    async fn list_tasks_passes_identity_as_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/workers/w1/tasks")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("account_id".into(), "acct".into()),
                Matcher::UrlEncoded("instance_id".into(), "i1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"task_ids":["t1","t2"]}"#)
            .create_async()
            .await;
        let id = WorkerIdentity::new("w1", "acct").with_instance_id("i1");
        let ids = transport(&server).list_tasks(&id).await.unwrap();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);
        mock.assert_async().await;
    }
}

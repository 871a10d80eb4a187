use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use perpetual_core::config::{TokenStatus, WorkerTokenConfig};
use sha2::{Digest, Sha256};

/// Why a worker credential was refused. The code is what the agent
/// branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Invalid,
    Expired,
    Revoked,
}

impl Rejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID_TOKEN",
            Self::Expired => "EXPIRED_TOKEN",
            Self::Revoked => "REVOKED_TOKEN",
        }
    }
}

struct KnownToken {
    name: String,
    digest: [u8; 32],
    status: TokenStatus,
    expires_at: Option<DateTime<Utc>>,
}

/// Verifies worker bearer tokens against the configured set.
///
/// Only SHA-256 digests are kept in memory. With no tokens configured the
/// worker routes are open.
pub struct WorkerAuth {
    tokens: Vec<KnownToken>,
}

impl WorkerAuth {
    pub fn new(tokens: &[WorkerTokenConfig]) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|t| KnownToken {
                    name: t.name.clone(),
                    digest: digest(&t.token),
                    status: t.status,
                    expires_at: t.expires_at,
                })
                .collect(),
        }
    }

    pub fn open() -> Self {
        Self { tokens: Vec::new() }
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Name of the matching token, or why it was refused.
    pub fn verify(&self, presented: &str, now: DateTime<Utc>) -> Result<&str, Rejection> {
        let presented = digest(presented);
        let token = self
            .tokens
            .iter()
            .find(|t| t.digest == presented)
            .ok_or(Rejection::Invalid)?;
        if token.status == TokenStatus::Revoked {
            return Err(Rejection::Revoked);
        }
        if token.expires_at.is_some_and(|at| at <= now) {
            return Err(Rejection::Expired);
        }
        Ok(&token.name)
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Axum middleware guarding worker routes with `Authorization: Bearer <token>`.
///
/// Missing or unknown token → 401 `INVALID_TOKEN`; revoked → 401
/// `REVOKED_TOKEN`; past `expires_at` → 401 `EXPIRED_TOKEN`.
pub async fn worker_auth_middleware(
    State(auth): State<Arc<WorkerAuth>>,
    req: Request,
    next: Next,
) -> Response {
    if auth.is_open() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");

    match auth.verify(presented, Utc::now()) {
        Ok(name) => {
            tracing::trace!(token = name, path = %req.uri().path(), "worker authenticated");
            next.run(req).await
        }
        Err(rejection) => {
            tracing::warn!(code = rejection.code(), path = %req.uri().path(), "worker credential refused");
            let body = serde_json::json!({
                "error": "unauthorized",
                "code": rejection.code(),
            });
            Response::builder()
                .status(401)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

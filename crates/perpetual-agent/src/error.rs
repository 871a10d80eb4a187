use std::fmt;

use thiserror::Error;

/// A credential or identity fault reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFault {
    Invalid,
    Expired,
    Revoked,
    Duplicate,
}

impl AuthFault {
    /// Map a control-plane error code to a fault.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "INVALID_TOKEN" => Some(Self::Invalid),
            "EXPIRED_TOKEN" => Some(Self::Expired),
            "REVOKED_TOKEN" => Some(Self::Revoked),
            "DUPLICATE_WORKER" => Some(Self::Duplicate),
            _ => None,
        }
    }

    /// Expired and revoked credentials freeze the worker; the rest are fatal.
    pub fn freezes(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

impl fmt::Display for AuthFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid token",
            Self::Expired => "expired token",
            Self::Revoked => "revoked token",
            Self::Duplicate => "duplicate worker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("control plane returned an empty response")]
    EmptyResponse,

    #[error("credential refused: {0}")]
    Auth(AuthFault),

    #[error("control plane returned {status}: {message}")]
    Protocol {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("transport closed")]
    Closed,

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("executor error: {0}")]
    Executor(String),
}

impl AgentError {
    /// Faults worth repeating the same request for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::EmptyResponse)
    }

    /// The control plane no longer knows this worker (e.g. after a restart).
    pub fn is_not_registered(&self) -> bool {
        matches!(self, Self::Protocol { code: Some(code), .. } if code == "NOT_REGISTERED")
    }
}

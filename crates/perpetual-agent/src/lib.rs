//! `perpetual-agent`: the worker side of the perpetual task protocol.
//!
//! A worker registers with the control plane, then repeatedly lists the
//! tasks it may run, acquires them, executes them through a
//! [`TaskExecutor`], and reports the result. Identity faults from the
//! control plane drive a small lifecycle state machine that can freeze the
//! worker or shut it down.
//!
//! # Architecture
//!
//! ```text
//! WorkerRunner      ← register, heartbeat loop, poll loop, drain on shutdown
//!     │
//!     ├── TaskAcquirer   ← in-flight dedup + bounded retry per task id
//!     │       │
//!     │       ▼
//!     ├── ControlPlane   ← HttpControlPlane (reqwest) in production
//!     │
//!     ├── TaskExecutor   ← CommandExecutor runs an external collector
//!     │
//!     └── Lifecycle      ← Healthy / Frozen / SelfDestructing / ShuttingDown
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use perpetual_agent::{CommandExecutor, HttpControlPlane, RunnerConfig, WorkerIdentity, WorkerRunner};
//!
//! let transport = Arc::new(HttpControlPlane::new("http://localhost:7470", None, Duration::from_secs(30))?);
//! let executor = Arc::new(CommandExecutor::new("./collect", vec![], Duration::from_secs(120)));
//! let runner = WorkerRunner::new(transport, WorkerIdentity::new("w1", "acct"), executor, RunnerConfig::default());
//! let exit = runner.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

pub mod acquire;
pub mod error;
pub mod executor;
pub mod identity;
pub mod lifecycle;
pub mod runner;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use acquire::{AcquireOutcome, TaskAcquirer};
pub use error::{AgentError, AuthFault};
pub use executor::{CommandExecutor, TaskExecutor};
pub use identity::WorkerIdentity;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use runner::{RunnerConfig, WorkerExit, WorkerRunner};
pub use transport::{ControlPlane, HttpControlPlane};
pub use types::{AcquireRequest, RunStatus, TaskPayload, TaskReport, TaskResult};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, AgentError>;

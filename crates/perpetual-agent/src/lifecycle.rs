//! Worker health and termination state.
//!
//! ```text
//! Healthy ──expired/revoked──▶ Frozen ──invalid/duplicate──▶ SelfDestructing
//!    │                                                              │
//!    └──────────invalid/duplicate───────────────────────────────────┘
//! any ──shutdown──▶ ShuttingDown (terminal)
//! ```
//!
//! Frozen stops new pulls but lets in-flight work finish and keeps the
//! transport open. SelfDestructing closes the transport and signals the
//! runner to stop without draining.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::error::{AgentError, AuthFault};
use crate::transport::ControlPlane;

const NEVER: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Healthy = 0,
    Frozen = 1,
    SelfDestructing = 2,
    ShuttingDown = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Healthy,
            1 => Self::Frozen,
            2 => Self::SelfDestructing,
            _ => Self::ShuttingDown,
        }
    }
}

pub struct Lifecycle {
    state: AtomicU8,
    /// Cleared by freeze, self-destruct and shutdown.
    acquire_tasks: AtomicBool,
    /// Operator switch used during coordinated upgrade or handoff.
    acquire_enabled: AtomicBool,
    frozen_at_ms: AtomicI64,
    last_heartbeat_ms: AtomicI64,
    heartbeat_timeout: Duration,
    transport: Arc<dyn ControlPlane>,
    terminate: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(transport: Arc<dyn ControlPlane>, heartbeat_timeout: Duration) -> Self {
        let (terminate, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(LifecycleState::Healthy as u8),
            acquire_tasks: AtomicBool::new(true),
            acquire_enabled: AtomicBool::new(true),
            frozen_at_ms: AtomicI64::new(NEVER),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            heartbeat_timeout,
            transport,
            terminate,
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn frozen_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.frozen_at_ms.load(Ordering::SeqCst))
    }

    /// Whether a new acquire attempt may start.
    pub fn can_acquire(&self) -> bool {
        self.acquire_enabled.load(Ordering::SeqCst) && self.acquire_tasks.load(Ordering::SeqCst)
    }

    pub fn acquire_tasks(&self) -> bool {
        self.acquire_tasks.load(Ordering::SeqCst)
    }

    pub fn set_acquire_enabled(&self, enabled: bool) {
        self.acquire_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "task acquisition switched");
    }

    /// Fires once with `true` when the worker should stop without draining.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.terminate.subscribe()
    }

    /// Apply the lifecycle consequence of `err`, if it has one. Returns true
    /// when the error was an identity fault.
    pub fn observe(&self, err: &AgentError) -> bool {
        match err {
            AgentError::Auth(fault) => {
                self.on_auth_fault(*fault);
                true
            }
            _ => false,
        }
    }

    pub fn on_auth_fault(&self, fault: AuthFault) {
        if fault.freezes() {
            self.freeze(fault);
        } else {
            self.self_destruct(fault);
        }
    }

    fn freeze(&self, fault: AuthFault) {
        let moved = self
            .state
            .compare_exchange(
                LifecycleState::Healthy as u8,
                LifecycleState::Frozen as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if moved {
            self.acquire_tasks.store(false, Ordering::SeqCst);
            self.frozen_at_ms
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            tracing::warn!(reason = %fault, "worker frozen; no new tasks will be acquired");
        }
    }

    fn self_destruct(&self, fault: AuthFault) {
        let moved = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match LifecycleState::from_u8(raw) {
                    LifecycleState::Healthy | LifecycleState::Frozen => {
                        Some(LifecycleState::SelfDestructing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        if moved {
            self.acquire_tasks.store(false, Ordering::SeqCst);
            self.transport.close();
            self.terminate.send_replace(true);
            tracing::error!(reason = %fault, "worker self-destructing");
        }
    }

    /// Enter the terminal state. In-flight work is left to drain.
    pub fn begin_shutdown(&self) {
        let previous = self
            .state
            .swap(LifecycleState::ShuttingDown as u8, Ordering::SeqCst);
        self.acquire_tasks.store(false, Ordering::SeqCst);
        if previous != LifecycleState::ShuttingDown as u8 {
            tracing::info!("worker shutting down");
        }
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        self.last_heartbeat_ms
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_heartbeat_ms.load(Ordering::SeqCst))
    }

    /// True while the last successful heartbeat is within the timeout.
    pub fn is_heartbeat_healthy(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_heartbeat() else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(self.heartbeat_timeout) else {
            return true;
        };
        now - last <= timeout
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

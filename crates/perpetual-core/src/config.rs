use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// BatchConfig
// ---------------------------------------------------------------------------

/// Caps applied when returning accumulated sync state to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_releases")]
    pub max_releases: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances_per_release: usize,
}

fn default_max_releases() -> usize {
    5
}

fn default_max_instances() -> usize {
    100
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_releases: default_max_releases(),
            max_instances_per_release: default_max_instances(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_wait")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_lock_hold")]
    pub hold_timeout_secs: u64,
    #[serde(default = "default_lock_poll")]
    pub poll_interval_ms: u64,
}

fn default_lock_wait() -> u64 {
    200
}

fn default_lock_hold() -> u64 {
    220
}

fn default_lock_poll() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_lock_wait(),
            hold_timeout_secs: default_lock_hold(),
            poll_interval_ms: default_lock_poll(),
        }
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Total acquire attempts per task, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_acquire_attempts: u32,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_heartbeat_timeout() -> u64 {
    15 * 60
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_acquire_attempts: default_max_attempts(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            poll_interval_secs: default_poll_interval(),
            max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// WorkerTokenConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Revoked,
}

fn default_token_status() -> TokenStatus {
    TokenStatus::Active
}

/// A credential workers present to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTokenConfig {
    pub name: String,
    pub token: String,
    #[serde(default = "default_token_status")]
    pub status: TokenStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default = "default_polled_keys_limit")]
    pub polled_keys_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_tokens: Vec<WorkerTokenConfig>,
}

fn default_version() -> u32 {
    1
}

/// Hard ceiling on polled keys reported back to callers.
pub const MAX_POLLED_KEYS: usize = 10;

fn default_polled_keys_limit() -> usize {
    MAX_POLLED_KEYS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            batch: BatchConfig::default(),
            lock: LockConfig::default(),
            worker: WorkerConfig::default(),
            polled_keys_limit: default_polled_keys_limit(),
            triggers_url: None,
            worker_tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load from `path` (if given) and then apply environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Override fields from environment-style variables.
    ///
    /// `lookup` is injected so tests do not have to mutate process env.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }

        let key = "PERPETUAL_BATCH_MAX_RELEASES";
        if let Some(v) = parse::<usize>(key, lookup(key)) {
            self.batch.max_releases = v;
        }
        let key = "PERPETUAL_BATCH_MAX_INSTANCES";
        if let Some(v) = parse::<usize>(key, lookup(key)) {
            self.batch.max_instances_per_release = v;
        }
        let key = "PERPETUAL_MAX_ACQUIRE_ATTEMPTS";
        if let Some(v) = parse::<u32>(key, lookup(key)) {
            self.worker.max_acquire_attempts = v;
        }
        let key = "PERPETUAL_HEARTBEAT_TIMEOUT_SECS";
        if let Some(v) = parse::<u64>(key, lookup(key)) {
            self.worker.heartbeat_timeout_secs = v;
        }
        let key = "PERPETUAL_LOCK_WAIT_SECS";
        if let Some(v) = parse::<u64>(key, lookup(key)) {
            self.lock.wait_timeout_secs = v;
        }
        let key = "PERPETUAL_LOCK_HOLD_SECS";
        if let Some(v) = parse::<u64>(key, lookup(key)) {
            self.lock.hold_timeout_secs = v;
        }
        if let Some(url) = lookup("PERPETUAL_TRIGGERS_URL").filter(|u| !u.trim().is_empty()) {
            self.triggers_url = Some(url);
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.batch.max_releases == 0 || self.batch.max_instances_per_release == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "batch limits must be greater than zero".to_string(),
            });
        }

        // A lease that expires before a waiter gives up lets a second holder in
        // while the first may still be working.
        if self.lock.hold_timeout_secs < self.lock.wait_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "lock.hold_timeout_secs ({}) is shorter than lock.wait_timeout_secs ({})",
                    self.lock.hold_timeout_secs, self.lock.wait_timeout_secs
                ),
            });
        }

        if self.polled_keys_limit == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "polled_keys_limit must be at least 1".to_string(),
            });
        } else if self.polled_keys_limit > MAX_POLLED_KEYS {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "polled_keys_limit ({}) exceeds {MAX_POLLED_KEYS}; it is clamped to {MAX_POLLED_KEYS}",
                    self.polled_keys_limit
                ),
            });
        }

        if self.worker.max_acquire_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "worker.max_acquire_attempts must be at least 1".to_string(),
            });
        }

        if self.worker.heartbeat_interval_secs >= self.worker.heartbeat_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "worker.heartbeat_interval_secs ({}) is not below the heartbeat timeout ({})",
                    self.worker.heartbeat_interval_secs, self.worker.heartbeat_timeout_secs
                ),
            });
        }

        for token in &self.worker_tokens {
            if token.token.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("worker token '{}' has an empty value", token.name),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

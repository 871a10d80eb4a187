use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::Subscription;

/// Reacts to registry mutations after they commit.
///
/// Errors are logged by the registry and never undo the mutation.
pub trait SubscriptionObserver: Send + Sync {
    fn on_saved(&self, subscription: &Subscription) -> Result<()>;
    fn on_updated(&self, subscription: &Subscription) -> Result<()>;
    fn on_deleted(&self, subscription: &Subscription) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Trigger status reporting
// ---------------------------------------------------------------------------

/// Poll outcome pushed to the trigger service for the given subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerStatusUpdate {
    pub account_id: String,
    pub signatures: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
    pub last_collected_versions: Vec<String>,
    pub last_collected_at: DateTime<Utc>,
    /// While set, the trigger service keeps showing the error status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_status_valid_until: Option<DateTime<Utc>>,
}

/// Destination for [`TriggerStatusUpdate`]s.
///
/// Implementations must not block for long: the registry calls this on the
/// request path. Returns whether the update was accepted.
pub trait TriggerStatusSink: Send + Sync {
    fn publish(&self, update: TriggerStatusUpdate) -> Result<bool>;
}

/// Sink used when no trigger service is configured.
pub struct LoggingTriggerSink;

impl TriggerStatusSink for LoggingTriggerSink {
    fn publish(&self, update: TriggerStatusUpdate) -> Result<bool> {
        tracing::info!(
            account = %update.account_id,
            signatures = ?update.signatures,
            success = update.success,
            versions = update.last_collected_versions.len(),
            "trigger polling status"
        );
        Ok(true)
    }
}

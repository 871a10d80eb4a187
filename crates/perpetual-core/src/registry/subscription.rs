use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PerpetualError, Result};
use crate::types::{Scope, SubscriptionType};

/// One watched target, shared by every subscriber whose signature is in
/// `signatures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub kind: SubscriptionType,
    /// Opaque watch descriptor (registry, image path, connector, ...).
    pub polling_info: Value,
    pub signatures: BTreeSet<String>,
    /// Keys seen by the most recent poll.
    #[serde(default)]
    pub polled_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perpetual_task_id: Option<String>,
    #[serde(default)]
    pub failed_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_polled_response_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn identity(&self) -> String {
        identity_key(&self.scope, self.kind, &self.polling_info)
    }

    /// `connectorRef` from the watch descriptor, if it names one.
    pub fn connector_ref(&self) -> Option<&str> {
        self.polling_info.get("connectorRef").and_then(Value::as_str)
    }

    /// Most recent stored keys, capped at `limit`. The cap bounds payload
    /// size; it is not a recency sort.
    pub fn polled_keys(&self, limit: usize) -> Vec<String> {
        self.polled_keys.iter().take(limit).cloned().collect()
    }

    /// Time of the last poll result, falling back to the last modification.
    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_modified_polled_response_at
            .unwrap_or(self.last_modified_at)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Dedup identity: SHA-256 of the canonical JSON of `(scope, type, polling_info)`.
///
/// Object keys are sorted recursively so two descriptors that differ only in
/// key order collapse to the same row.
pub fn identity_key(scope: &Scope, kind: SubscriptionType, polling_info: &Value) -> String {
    let doc = serde_json::json!({
        "scope": canonical(&serde_json::to_value(scope).unwrap_or(Value::Null)),
        "type": kind,
        "polling_info": canonical(polling_info),
    });
    let digest = Sha256::digest(doc.to_string().as_bytes());
    format!("{digest:x}")
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A subscribe/save/unsubscribe call from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Present when the client already holds a subscription id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub kind: SubscriptionType,
    #[serde(default)]
    pub polling_info: Value,
    pub signatures: BTreeSet<String>,
}

impl SubscriptionRequest {
    pub fn new<I, S>(scope: Scope, kind: SubscriptionType, polling_info: Value, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            scope,
            kind,
            polling_info,
            signatures: signatures.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.scope.validate()?;
        if self.signatures.is_empty() || self.signatures.iter().any(|s| s.trim().is_empty()) {
            return Err(PerpetualError::validation("signatures must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn into_subscription(self, id: String, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id,
            scope: self.scope,
            kind: self.kind,
            polling_info: self.polling_info,
            signatures: self.signatures,
            polled_keys: Vec::new(),
            perpetual_task_id: None,
            failed_attempts: 0,
            created_at: now,
            last_modified_at: now,
            last_modified_polled_response_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub subscription_id: String,
    /// True when the request joined a row that already existed.
    pub existing: bool,
    #[serde(default)]
    pub last_polled: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perpetual_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingInfoForTriggers {
    pub subscription_id: String,
    pub polled_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perpetual_task_id: Option<String>,
}

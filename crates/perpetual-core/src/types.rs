use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{PerpetualError, Result};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Ownership scope of a record: an account, optionally narrowed to an org and
/// a project within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl Scope {
    pub fn account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: None,
            project_id: None,
        }
    }

    pub fn project(
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: Some(org_id.into()),
            project_id: Some(project_id.into()),
        }
    }

    /// Reject scopes without an account. Org and project are optional.
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(PerpetualError::validation("account id must not be empty"));
        }
        if self.project_id.is_some() && self.org_id.is_none() {
            return Err(PerpetualError::validation(
                "project scope requires an org id",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.account_id)?;
        if let Some(org) = &self.org_id {
            write!(f, "/{org}")?;
        }
        if let Some(project) = &self.project_id {
            write!(f, "/{project}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SubscriptionType
// ---------------------------------------------------------------------------

/// What a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Artifact,
    Manifest,
    Webhook,
}

impl SubscriptionType {
    /// The perpetual task type that services this kind of watch.
    pub fn task_type(self) -> PerpetualTaskType {
        match self {
            Self::Artifact => PerpetualTaskType::ArtifactCollection,
            Self::Manifest => PerpetualTaskType::ManifestCollection,
            Self::Webhook => PerpetualTaskType::GitPolling,
        }
    }
}

// ---------------------------------------------------------------------------
// PerpetualTaskType / Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerpetualTaskType {
    ArtifactCollection,
    ManifestCollection,
    GitPolling,
    InstanceSync,
}

impl PerpetualTaskType {
    /// Interval and timeout are fixed per task type; subscribers cannot tune them.
    pub fn schedule(self) -> Schedule {
        match self {
            Self::ArtifactCollection | Self::ManifestCollection | Self::GitPolling => Schedule {
                interval: Duration::from_secs(60),
                timeout: Duration::from_secs(120),
            },
            Self::InstanceSync => Schedule {
                interval: Duration::from_secs(600),
                timeout: Duration::from_secs(900),
            },
        }
    }
}

impl fmt::Display for PerpetualTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ArtifactCollection => "ARTIFACT_COLLECTION",
            Self::ManifestCollection => "MANIFEST_COLLECTION",
            Self::GitPolling => "GIT_POLLING",
            Self::InstanceSync => "INSTANCE_SYNC",
        };
        f.write_str(s)
    }
}

/// How often a perpetual task runs and how long a single run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as seconds: u64)
// ---------------------------------------------------------------------------

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_without_account_is_rejected() {
        let scope = Scope::account("  ");
        assert!(matches!(scope.validate(), Err(PerpetualError::Validation(_))));
    }

    #[test]
    fn project_scope_requires_org() {
        let scope = Scope {
            account_id: "acct".into(),
            org_id: None,
            project_id: Some("proj".into()),
        };
        assert!(scope.validate().is_err());
        assert!(Scope::project("acct", "org", "proj").validate().is_ok());
    }

    #[test]
    fn scope_display_joins_present_levels() {
        assert_eq!(Scope::account("a").to_string(), "a");
        assert_eq!(Scope::project("a", "o", "p").to_string(), "a/o/p");
    }

    #[test]
    fn subscription_types_map_to_polling_tasks() {
        assert_eq!(
            SubscriptionType::Artifact.task_type(),
            PerpetualTaskType::ArtifactCollection
        );
        assert_eq!(
            SubscriptionType::Webhook.task_type(),
            PerpetualTaskType::GitPolling
        );
    }

    #[test]
    fn instance_sync_runs_less_often_than_polling() {
        let poll = PerpetualTaskType::ArtifactCollection.schedule();
        let sync = PerpetualTaskType::InstanceSync.schedule();
        assert!(sync.interval > poll.interval);
        assert!(poll.timeout > poll.interval);
    }

    #[test]
    fn schedule_serializes_as_seconds() {
        let json = serde_json::to_value(PerpetualTaskType::GitPolling.schedule()).unwrap();
        assert_eq!(json["interval"], 60);
        assert_eq!(json["timeout"], 120);
    }
}

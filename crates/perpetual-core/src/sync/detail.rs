use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Scope;

/// One deployed release, identified by an opaque key, with the set of
/// instances currently known for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIdentifier {
    pub key: String,
    #[serde(default)]
    pub instances: BTreeSet<String>,
    /// After this moment the release is dropped from its detail row on the
    /// next sync report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<DateTime<Utc>>,
}

impl ReleaseIdentifier {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            instances: BTreeSet::new(),
            delete_after: None,
        }
    }

    pub fn with_instances<I, S>(mut self, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instances.extend(instances.into_iter().map(Into::into));
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.delete_after.is_some_and(|at| at <= now)
    }

    fn absorb(&mut self, other: &ReleaseIdentifier) {
        self.instances.extend(other.instances.iter().cloned());
        self.delete_after = match (self.delete_after, other.delete_after) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Union two release sets by key.
///
/// Instance sets are unioned and `delete_after` takes the later value, so
/// the result is independent of argument order and merging the same input
/// twice is a no-op. Output is sorted by key.
pub fn merge_releases(a: &[ReleaseIdentifier], b: &[ReleaseIdentifier]) -> Vec<ReleaseIdentifier> {
    let mut by_key: BTreeMap<String, ReleaseIdentifier> = BTreeMap::new();
    for release in a.iter().chain(b) {
        match by_key.get_mut(&release.key) {
            Some(existing) => existing.absorb(release),
            None => {
                by_key.insert(release.key.clone(), release.clone());
            }
        }
    }
    by_key.into_values().collect()
}

/// Where the next bounded fetch of a detail row starts.
///
/// `release_offset` indexes the key-sorted release list; each entry of
/// `instance_offsets` indexes the sorted instance set of that release. Both
/// advance by one page every time the page is served, so repeated fetches
/// walk the whole row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCursor {
    #[serde(default)]
    pub release_offset: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_offsets: BTreeMap<String, usize>,
}

/// Tracked release set for one deployed resource, bound to the perpetual
/// task that keeps it in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTaskDetail {
    pub id: String,
    pub scope: Scope,
    /// The watched resource (e.g. a cluster namespace or a host group).
    pub resource_key: String,
    /// Coarser identity shared by resources that one task can serve (e.g. a
    /// cloud account or cluster connection).
    pub owner_key: String,
    pub perpetual_task_id: String,
    #[serde(default)]
    pub releases: Vec<ReleaseIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cursor: BatchCursor,
}

impl SyncTaskDetail {
    pub fn release(&self, key: &str) -> Option<&ReleaseIdentifier> {
        self.releases.iter().find(|r| r.key == key)
    }
}

// ---------------------------------------------------------------------------
// Inbound events and reports
// ---------------------------------------------------------------------------

/// A deployment finished and produced (or updated) releases on a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub scope: Scope,
    pub resource_key: String,
    pub owner_key: String,
    #[serde(default)]
    pub releases: Vec<ReleaseIdentifier>,
    /// Opaque context handed to the scheduler if a new task is needed.
    #[serde(default)]
    pub client_context: serde_json::Value,
}

/// How a deployment event was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// An existing row for the resource absorbed the releases.
    Merged,
    /// A new row was attached to a task already serving the same owner.
    Attached,
    /// A new task and a new row were created.
    Created,
    /// The resource lock could not be taken in time; the event was dropped.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub action: SyncAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perpetual_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Instances a worker observed for one detail row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub detail_id: String,
    #[serde(default)]
    pub releases: Vec<ReleaseIdentifier>,
}

/// Result of one instance-sync run, reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub instances: Vec<InstanceData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rel(key: &str, instances: &[&str]) -> ReleaseIdentifier {
        ReleaseIdentifier::new(key).with_instances(instances.iter().copied())
    }

    #[test]
    fn merge_is_commutative() {
        let now = Utc::now();
        let mut a1 = rel("r1", &["i1", "i2"]);
        a1.delete_after = Some(now);
        let a = vec![a1, rel("r2", &["i9"])];
        let mut b1 = rel("r1", &["i3"]);
        b1.delete_after = Some(now + Duration::hours(1));
        let b = vec![b1, rel("r3", &[])];

        let ab = merge_releases(&a, &b);
        let ba = merge_releases(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 3);
        let r1 = ab.iter().find(|r| r.key == "r1").unwrap();
        assert_eq!(r1.instances.len(), 3);
        assert_eq!(r1.delete_after, Some(now + Duration::hours(1)));
    }

    #[test]
    fn merge_is_idempotent() {
        let a = vec![rel("r1", &["i1"]), rel("r2", &["i2"])];
        let once = merge_releases(&a, &a);
        assert_eq!(once, a);
        assert_eq!(merge_releases(&once, &a), once);
    }

    #[test]
    fn merge_keeps_known_delete_after_when_other_side_has_none() {
        let at = Utc::now();
        let mut a = rel("r1", &[]);
        a.delete_after = Some(at);
        let merged = merge_releases(&[a], &[rel("r1", &["i1"])]);
        assert_eq!(merged[0].delete_after, Some(at));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let mut r = rel("r1", &[]);
        assert!(!r.is_expired(now));
        r.delete_after = Some(now);
        assert!(r.is_expired(now));
        r.delete_after = Some(now + Duration::seconds(5));
        assert!(!r.is_expired(now));
    }
}

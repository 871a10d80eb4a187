//! Size caps for sync state handed back to workers.
//!
//! A detail row may accumulate any number of releases; a single fetch
//! returns at most `max_releases` of them and, within each, at most
//! `max_instances_per_release` instances. The window starts at the row's
//! [`BatchCursor`] and wraps around, and the cursor moves past what was
//! served, so consecutive fetches walk every release and every instance.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::BatchConfig;
use crate::sync::{BatchCursor, ReleaseIdentifier, SyncTaskDetail};

/// Bounded view of one detail row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailBatch {
    pub detail_id: String,
    pub resource_key: String,
    pub releases: Vec<ReleaseIdentifier>,
    /// True when anything was cut.
    pub truncated: bool,
}

/// Take the page of `releases` that starts at `cursor` and advance it.
///
/// `releases` is expected in key order, as [`crate::sync::merge_releases`]
/// leaves it. The returned page is key-sorted as well.
pub fn batch_releases(
    releases: &[ReleaseIdentifier],
    cursor: &mut BatchCursor,
    limits: &BatchConfig,
) -> (Vec<ReleaseIdentifier>, bool) {
    let total = releases.len();
    let mut truncated = total > limits.max_releases;
    let (start, take) = if truncated {
        (cursor.release_offset % total, limits.max_releases)
    } else {
        (0, total)
    };
    cursor.release_offset = if truncated { (start + take) % total } else { 0 };

    let mut batch: Vec<ReleaseIdentifier> = releases
        .iter()
        .cycle()
        .skip(start)
        .take(take)
        .map(|release| {
            let (instances, cut) = instance_window(release, cursor, limits.max_instances_per_release);
            truncated |= cut;
            ReleaseIdentifier {
                key: release.key.clone(),
                instances,
                delete_after: release.delete_after,
            }
        })
        .collect();
    batch.sort_by(|a, b| a.key.cmp(&b.key));

    cursor
        .instance_offsets
        .retain(|key, _| releases.iter().any(|r| &r.key == key));
    (batch, truncated)
}

fn instance_window(release: &ReleaseIdentifier, cursor: &mut BatchCursor, cap: usize) -> (BTreeSet<String>, bool) {
    let total = release.instances.len();
    if total <= cap {
        cursor.instance_offsets.remove(&release.key);
        return (release.instances.clone(), false);
    }
    let offset = cursor.instance_offsets.entry(release.key.clone()).or_insert(0);
    let start = *offset % total;
    *offset = (start + cap) % total;
    let window = release.instances.iter().cycle().skip(start).take(cap).cloned().collect();
    (window, true)
}

/// Next page of `detail`; advances the row's cursor in place.
pub fn batch_detail(detail: &mut SyncTaskDetail, limits: &BatchConfig) -> DetailBatch {
    let (releases, truncated) = batch_releases(&detail.releases, &mut detail.cursor, limits);
    DetailBatch {
        detail_id: detail.id.clone(),
        resource_key: detail.resource_key.clone(),
        releases,
        truncated,
    }
}

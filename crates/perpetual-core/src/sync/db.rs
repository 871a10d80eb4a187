//! redb-backed sync task detail rows.
//!
//! ```text
//! sync_details         detail id                 → SyncTaskDetail (JSON)
//! sync_resource_index  account ␟ resource_key    → detail id
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use redb::TableDefinition;

use crate::batch::{batch_detail, DetailBatch};
use crate::config::BatchConfig;
use crate::error::{db_err, Result};
use crate::store::{encode, index_key, read_json, read_key, scan_json, JsonTable, Store};
use crate::sync::{merge_releases, ReleaseIdentifier, SyncTaskDetail};

const DETAILS: JsonTable = TableDefinition::new("sync_details");
const RESOURCE_INDEX: JsonTable = TableDefinition::new("sync_resource_index");

/// What a sync report changed on one row.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedReport {
    pub detail: SyncTaskDetail,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct SyncDetailDb {
    store: Store,
}

impl SyncDetailDb {
    pub fn new(store: Store) -> Result<Self> {
        store.ensure_table(DETAILS)?;
        store.ensure_table(RESOURCE_INDEX)?;
        Ok(Self { store })
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncTaskDetail>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let table = rt.open_table(DETAILS).map_err(db_err)?;
        read_json(&table, id)
    }

    /// Exact match on `(account, resource_key)`.
    pub fn find_by_resource(&self, account_id: &str, resource_key: &str) -> Result<Option<SyncTaskDetail>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let index = rt.open_table(RESOURCE_INDEX).map_err(db_err)?;
        let Some(id) = read_key(&index, &index_key(&[account_id, resource_key]))? else {
            return Ok(None);
        };
        let table = rt.open_table(DETAILS).map_err(db_err)?;
        read_json(&table, &id)
    }

    /// Oldest row in `account_id` belonging to `owner_key`, any resource.
    pub fn find_by_owner(&self, account_id: &str, owner_key: &str) -> Result<Option<SyncTaskDetail>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|d| d.scope.account_id == account_id && d.owner_key == owner_key)
            .min_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    /// Every row bound to `perpetual_task_id`, ordered by resource key.
    pub fn list_for_task(&self, perpetual_task_id: &str) -> Result<Vec<SyncTaskDetail>> {
        let mut rows: Vec<SyncTaskDetail> = self
            .scan()?
            .into_iter()
            .filter(|d| d.perpetual_task_id == perpetual_task_id)
            .collect();
        rows.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(rows)
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<SyncTaskDetail>> {
        let mut rows: Vec<SyncTaskDetail> = self
            .scan()?
            .into_iter()
            .filter(|d| d.scope.account_id == account_id)
            .collect();
        rows.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(rows)
    }

    fn scan(&self) -> Result<Vec<SyncTaskDetail>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let table = rt.open_table(DETAILS).map_err(db_err)?;
        scan_json(&table)
    }

    /// Insert `detail`, or, if its resource already has a row, merge its
    /// releases into that row instead. Returns the stored row and whether
    /// an existing row absorbed it.
    pub fn insert_or_merge(&self, detail: SyncTaskDetail) -> Result<(SyncTaskDetail, bool)> {
        let key = index_key(&[detail.scope.account_id.as_str(), detail.resource_key.as_str()]);
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let result = {
            let mut table = wt.open_table(DETAILS).map_err(db_err)?;
            let mut index = wt.open_table(RESOURCE_INDEX).map_err(db_err)?;
            let existing: Option<SyncTaskDetail> = match read_key(&index, &key)? {
                Some(id) => read_json(&table, &id)?,
                None => None,
            };
            match existing {
                Some(mut row) => {
                    row.releases = merge_releases(&row.releases, &detail.releases);
                    table.insert(row.id.as_str(), encode(&row)?.as_slice()).map_err(db_err)?;
                    (row, true)
                }
                None => {
                    table
                        .insert(detail.id.as_str(), encode(&detail)?.as_slice())
                        .map_err(db_err)?;
                    index.insert(key.as_str(), detail.id.as_bytes()).map_err(db_err)?;
                    (detail, false)
                }
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(result)
    }

    /// Union `releases` into row `id`.
    pub fn merge(&self, id: &str, releases: &[ReleaseIdentifier]) -> Result<Option<SyncTaskDetail>> {
        self.update(id, |row| {
            row.releases = merge_releases(&row.releases, releases);
        })
    }

    /// Fold a worker's observations into row `id`: reported releases are
    /// merged, then every release whose `delete_after` has passed is dropped.
    pub fn apply_report(
        &self,
        id: &str,
        reported: &[ReleaseIdentifier],
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedReport>> {
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        let row = self.update(id, |row| {
            let before: BTreeSet<String> = row.releases.iter().map(|r| r.key.clone()).collect();
            let mut merged = merge_releases(&row.releases, reported);
            merged.retain(|r| {
                if r.is_expired(now) {
                    if before.contains(&r.key) {
                        removed.push(r.key.clone());
                    }
                    false
                } else {
                    true
                }
            });
            updated = reported
                .iter()
                .filter(|r| !r.is_expired(now))
                .map(|r| r.key.clone())
                .collect();
            row.releases = merged;
        })?;
        Ok(row.map(|detail| AppliedReport {
            detail,
            updated,
            removed,
        }))
    }

    /// Serve the next bounded page of row `id` and advance its cursor in
    /// the same write transaction.
    pub fn next_batch(&self, id: &str, limits: &BatchConfig) -> Result<Option<DetailBatch>> {
        let mut batch = None;
        self.update(id, |row| batch = Some(batch_detail(row, limits)))?;
        Ok(batch)
    }

    pub fn set_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.update(id, |row| row.last_run_at = Some(at))?.is_some())
    }

    fn update<F>(&self, id: &str, f: F) -> Result<Option<SyncTaskDetail>>
    where
        F: FnOnce(&mut SyncTaskDetail),
    {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let result = {
            let mut table = wt.open_table(DETAILS).map_err(db_err)?;
            let current: Option<SyncTaskDetail> = read_json(&table, id)?;
            match current {
                Some(mut row) => {
                    f(&mut row);
                    table.insert(id, encode(&row)?.as_slice()).map_err(db_err)?;
                    Some(row)
                }
                None => None,
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(result)
    }
}

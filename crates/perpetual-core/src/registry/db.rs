//! redb-backed subscription table plus an identity index.
//!
//! ```text
//! subscriptions          id        → Subscription (JSON)
//! subscription_identity  sha256    → id
//! ```
//!
//! Every mutation runs inside one write transaction, so the find-or-insert
//! in [`SubscriptionDb::upsert_merge`] and the remove-or-delete in
//! [`SubscriptionDb::remove_signatures`] are atomic with respect to each
//! other.

use std::collections::BTreeSet;

use chrono::Utc;
use redb::{ReadableTableMetadata, TableDefinition};

use crate::error::{db_err, Result};
use crate::registry::Subscription;
use crate::store::{encode, read_json, read_key, scan_json, JsonTable, Store};
use crate::types::Scope;

const SUBSCRIPTIONS: JsonTable = TableDefinition::new("subscriptions");
const IDENTITY: JsonTable = TableDefinition::new("subscription_identity");

/// Result of removing signatures from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    /// The last signature left; the row is gone.
    Deleted(Subscription),
    /// Other subscribers remain.
    Updated(Subscription),
    NotFound,
}

#[derive(Clone)]
pub struct SubscriptionDb {
    store: Store,
}

impl SubscriptionDb {
    pub fn new(store: Store) -> Result<Self> {
        store.ensure_table(SUBSCRIPTIONS)?;
        store.ensure_table(IDENTITY)?;
        Ok(Self { store })
    }

    /// Union `candidate.signatures` into the row with the same identity, or
    /// insert `candidate` as a new row.
    ///
    /// Returns the stored row and whether it already existed.
    pub fn upsert_merge(&self, candidate: Subscription) -> Result<(Subscription, bool)> {
        let identity = candidate.identity();
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let result = {
            let mut rows = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
            let mut index = wt.open_table(IDENTITY).map_err(db_err)?;
            let existing_id = read_key(&index, &identity)?;
            let existing: Option<Subscription> = match &existing_id {
                Some(id) => read_json(&rows, id)?,
                None => None,
            };
            match existing {
                Some(mut row) => {
                    let before = row.signatures.len();
                    row.signatures.extend(candidate.signatures);
                    if row.signatures.len() != before {
                        row.last_modified_at = Utc::now();
                    }
                    rows.insert(row.id.as_str(), encode(&row)?.as_slice())
                        .map_err(db_err)?;
                    (row, true)
                }
                None => {
                    rows.insert(candidate.id.as_str(), encode(&candidate)?.as_slice())
                        .map_err(db_err)?;
                    index
                        .insert(identity.as_str(), candidate.id.as_bytes())
                        .map_err(db_err)?;
                    (candidate, false)
                }
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(result)
    }

    /// Drop `signatures` from row `id`; delete the row if that empties it.
    pub fn remove_signatures(
        &self,
        account_id: &str,
        id: &str,
        signatures: &BTreeSet<String>,
    ) -> Result<RemoveOutcome> {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let outcome = {
            let mut rows = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
            let mut index = wt.open_table(IDENTITY).map_err(db_err)?;
            let row: Option<Subscription> = read_json(&rows, id)?;
            match row.filter(|r| r.scope.account_id == account_id) {
                None => RemoveOutcome::NotFound,
                Some(mut row) => {
                    row.signatures.retain(|s| !signatures.contains(s));
                    if row.signatures.is_empty() {
                        rows.remove(id).map_err(db_err)?;
                        index.remove(row.identity().as_str()).map_err(db_err)?;
                        RemoveOutcome::Deleted(row)
                    } else {
                        row.last_modified_at = Utc::now();
                        rows.insert(id, encode(&row)?.as_slice()).map_err(db_err)?;
                        RemoveOutcome::Updated(row)
                    }
                }
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(outcome)
    }

    /// Apply `f` to row `id` in place. Returns the updated row, or `None`
    /// when the row does not exist in `account_id`.
    pub fn modify<F>(&self, account_id: &str, id: &str, f: F) -> Result<Option<Subscription>>
    where
        F: FnOnce(&mut Subscription),
    {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let updated = {
            let mut rows = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
            let row: Option<Subscription> = read_json(&rows, id)?;
            match row.filter(|r| r.scope.account_id == account_id) {
                Some(mut row) => {
                    f(&mut row);
                    row.last_modified_at = Utc::now();
                    rows.insert(id, encode(&row)?.as_slice()).map_err(db_err)?;
                    Some(row)
                }
                None => None,
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(updated)
    }

    /// Remove every row whose scope is exactly `scope`. Returns the count.
    pub fn delete_scope(&self, scope: &Scope) -> Result<usize> {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let removed = {
            let mut rows = wt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
            let mut index = wt.open_table(IDENTITY).map_err(db_err)?;
            let doomed: Vec<Subscription> = scan_json::<Subscription, _>(&rows)?
                .into_iter()
                .filter(|r| &r.scope == scope)
                .collect();
            for row in &doomed {
                rows.remove(row.id.as_str()).map_err(db_err)?;
                index.remove(row.identity().as_str()).map_err(db_err)?;
            }
            doomed.len()
        };
        wt.commit().map_err(db_err)?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, account_id: &str, id: &str) -> Result<Option<Subscription>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let rows = rt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
        let row: Option<Subscription> = read_json(&rows, id)?;
        Ok(row.filter(|r| r.scope.account_id == account_id))
    }

    /// Row `id` if any of `signatures` currently owns it.
    pub fn find_for_signatures(
        &self,
        account_id: &str,
        id: &str,
        signatures: &BTreeSet<String>,
    ) -> Result<Option<Subscription>> {
        let row = self.get(account_id, id)?;
        Ok(row.filter(|r| !r.signatures.is_disjoint(signatures)))
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<Subscription>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let rows = rt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
        let mut all: Vec<Subscription> = scan_json::<Subscription, _>(&rows)?
            .into_iter()
            .filter(|r| r.scope.account_id == account_id)
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    pub fn count(&self) -> Result<u64> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let rows = rt.open_table(SUBSCRIPTIONS).map_err(db_err)?;
        rows.len().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriptionRequest;
    use crate::types::SubscriptionType;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, SubscriptionDb) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("subs.redb")).unwrap();
        (dir, SubscriptionDb::new(store).unwrap())
    }

    fn candidate(id: &str, sig: &str) -> Subscription {
        SubscriptionRequest::new(
            Scope::account("acct"),
            SubscriptionType::Artifact,
            json!({"connectorRef": "docker", "imagePath": "library/nginx"}),
            [sig],
        )
        .into_subscription(id.to_string(), Utc::now())
    }

    fn sigs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn upsert_merges_signatures_into_one_row() {
        let (_dir, db) = open_tmp();
        let (first, existed) = db.upsert_merge(candidate("id-1", "s1")).unwrap();
        assert!(!existed);
        let (second, existed) = db.upsert_merge(candidate("id-2", "s2")).unwrap();
        assert!(existed);
        assert_eq!(second.id, first.id);
        assert_eq!(second.signatures, sigs(&["s1", "s2"]));
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn remove_last_signature_deletes_row_and_identity() {
        let (_dir, db) = open_tmp();
        db.upsert_merge(candidate("id-1", "s1")).unwrap();
        db.upsert_merge(candidate("id-x", "s2")).unwrap();

        let out = db.remove_signatures("acct", "id-1", &sigs(&["s1"])).unwrap();
        assert!(matches!(out, RemoveOutcome::Updated(ref r) if r.signatures == sigs(&["s2"])));
        let out = db.remove_signatures("acct", "id-1", &sigs(&["s2"])).unwrap();
        assert!(matches!(out, RemoveOutcome::Deleted(_)));
        assert_eq!(db.count().unwrap(), 0);

        // identity slot is free again
        let (_, existed) = db.upsert_merge(candidate("id-3", "s3")).unwrap();
        assert!(!existed);
    }

    #[test]
    fn remove_is_account_scoped() {
        let (_dir, db) = open_tmp();
        db.upsert_merge(candidate("id-1", "s1")).unwrap();
        let out = db.remove_signatures("other", "id-1", &sigs(&["s1"])).unwrap();
        assert_eq!(out, RemoveOutcome::NotFound);
        assert!(db.get("other", "id-1").unwrap().is_none());
        assert!(db.get("acct", "id-1").unwrap().is_some());
    }

    #[test]
    fn find_for_signatures_requires_ownership() {
        let (_dir, db) = open_tmp();
        db.upsert_merge(candidate("id-1", "s1")).unwrap();
        assert!(db.find_for_signatures("acct", "id-1", &sigs(&["s1"])).unwrap().is_some());
        assert!(db.find_for_signatures("acct", "id-1", &sigs(&["zz"])).unwrap().is_none());
    }

    #[test]
    fn delete_scope_only_touches_exact_scope() {
        let (_dir, db) = open_tmp();
        db.upsert_merge(candidate("id-1", "s1")).unwrap();
        let mut project = candidate("id-2", "s2");
        project.scope = Scope::project("acct", "org", "proj");
        db.upsert_merge(project).unwrap();

        let removed = db.delete_scope(&Scope::project("acct", "org", "proj")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.list("acct").unwrap().len(), 1);
    }

    #[test]
    fn modify_updates_in_place() {
        let (_dir, db) = open_tmp();
        db.upsert_merge(candidate("id-1", "s1")).unwrap();
        let row = db
            .modify("acct", "id-1", |r| r.failed_attempts = 4)
            .unwrap()
            .unwrap();
        assert_eq!(row.failed_attempts, 4);
        assert!(db.modify("acct", "missing", |_| {}).unwrap().is_none());
    }
}

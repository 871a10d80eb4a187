use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::MAX_POLLED_KEYS;
use crate::error::{PerpetualError, Result};
use crate::registry::{
    LoggingTriggerSink, PollingInfoForTriggers, RemoveOutcome, SaveOutcome, Subscription,
    SubscriptionDb, SubscriptionObserver, SubscriptionRequest, TriggerStatusSink,
    TriggerStatusUpdate,
};
use crate::types::Scope;

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Saved,
    Updated,
    Deleted,
}

/// Dedup front door for watch requests.
///
/// Overlapping requests for the same `(scope, type, polling_info)` share one
/// row; observers learn about row creation, reset and deletion so the
/// backing perpetual task follows the row.
pub struct SubscriptionRegistry {
    db: SubscriptionDb,
    observers: Vec<Arc<dyn SubscriptionObserver>>,
    triggers: Arc<dyn TriggerStatusSink>,
    polled_keys_limit: usize,
}

impl SubscriptionRegistry {
    /// `polled_keys_limit` is clamped to [`MAX_POLLED_KEYS`].
    pub fn new(db: SubscriptionDb, polled_keys_limit: usize) -> Self {
        Self {
            db,
            observers: Vec::new(),
            triggers: Arc::new(LoggingTriggerSink),
            polled_keys_limit: polled_keys_limit.min(MAX_POLLED_KEYS),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SubscriptionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_trigger_sink(mut self, sink: Arc<dyn TriggerStatusSink>) -> Self {
        self.triggers = sink;
        self
    }

    pub fn db(&self) -> &SubscriptionDb {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Save / subscribe / unsubscribe
    // -----------------------------------------------------------------------

    /// Join an existing row with the same identity, or create one.
    ///
    /// A client-supplied id is never reused for a new row: another
    /// subscriber may still hold it.
    pub fn save(&self, request: SubscriptionRequest) -> Result<SaveOutcome> {
        request.validate()?;
        let candidate = request.into_subscription(Uuid::new_v4().to_string(), Utc::now());
        let (row, existing) = self.db.upsert_merge(candidate)?;

        if existing {
            tracing::debug!(subscription_id = %row.id, signatures = row.signatures.len(), "joined existing subscription");
            return Ok(SaveOutcome {
                subscription_id: row.id.clone(),
                existing: true,
                last_polled: self.polled_keys(&row),
                last_update: Some(row.last_update()),
                perpetual_task_id: row.perpetual_task_id.clone(),
            });
        }

        tracing::info!(subscription_id = %row.id, scope = %row.scope, kind = ?row.kind, "subscription created");
        self.notify(Lifecycle::Saved, &row);
        // Observers may have attached a task id.
        let perpetual_task_id = self
            .db
            .get(&row.scope.account_id, &row.id)?
            .and_then(|r| r.perpetual_task_id);
        Ok(SaveOutcome {
            subscription_id: row.id,
            existing: false,
            last_polled: Vec::new(),
            last_update: None,
            perpetual_task_id,
        })
    }

    /// Save, or refresh an existing subscription the caller already owns.
    ///
    /// If the caller's row still watches the same target this is a no-op.
    /// If the target changed, the caller leaves the old row and a new row is
    /// saved, since the identity (and so the id) cannot be kept.
    pub fn subscribe(&self, request: SubscriptionRequest) -> Result<SaveOutcome> {
        request.validate()?;
        let owned = match &request.id {
            Some(id) => self
                .db
                .find_for_signatures(&request.scope.account_id, id, &request.signatures)?,
            None => None,
        };
        let Some(row) = owned else {
            return self.save(request);
        };

        if row.polling_info == request.polling_info {
            return Ok(SaveOutcome {
                subscription_id: row.id.clone(),
                existing: true,
                last_polled: self.polled_keys(&row),
                last_update: Some(row.last_update()),
                perpetual_task_id: row.perpetual_task_id.clone(),
            });
        }

        tracing::info!(subscription_id = %row.id, "polling info changed; re-subscribing");
        self.leave(&row.scope.account_id, &row.id, &request.signatures)?;
        let mut outcome = self.save(SubscriptionRequest { id: None, ..request })?;
        // The caller's view is a fresh subscription even if it merged.
        outcome.existing = false;
        outcome.last_polled.clear();
        outcome.last_update = None;
        Ok(outcome)
    }

    /// Remove `signatures` from row `id`. The row and its task go away only
    /// when no subscriber is left. Returns false if the row was not found.
    pub fn unsubscribe(&self, account_id: &str, id: &str, signatures: &BTreeSet<String>) -> Result<bool> {
        if signatures.is_empty() {
            return Err(PerpetualError::validation("signatures must not be empty"));
        }
        self.leave(account_id, id, signatures)
    }

    fn leave(&self, account_id: &str, id: &str, signatures: &BTreeSet<String>) -> Result<bool> {
        match self.db.remove_signatures(account_id, id, signatures)? {
            RemoveOutcome::Deleted(row) => {
                tracing::info!(subscription_id = %row.id, "last subscriber left; subscription deleted");
                self.notify(Lifecycle::Deleted, &row);
                Ok(true)
            }
            RemoveOutcome::Updated(row) => {
                tracing::debug!(subscription_id = %row.id, remaining = row.signatures.len(), "subscriber left");
                Ok(true)
            }
            RemoveOutcome::NotFound => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get(&self, account_id: &str, id: &str) -> Result<Option<Subscription>> {
        self.db.get(account_id, id)
    }

    pub fn get_many(&self, account_id: &str, ids: &[String]) -> Result<Vec<Subscription>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.db.get(account_id, id)? {
                found.push(row);
            }
        }
        Ok(found)
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<Subscription>> {
        self.db.list(account_id)
    }

    pub fn ids_by_signatures(&self, account_id: &str, signatures: &BTreeSet<String>) -> Result<Vec<String>> {
        Ok(self
            .db
            .list(account_id)?
            .into_iter()
            .filter(|r| !r.signatures.is_disjoint(signatures))
            .map(|r| r.id)
            .collect())
    }

    pub fn by_connector(&self, account_id: &str, connector_ref: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .db
            .list(account_id)?
            .into_iter()
            .filter(|r| r.connector_ref() == Some(connector_ref))
            .collect())
    }

    /// Up to `polled_keys_limit` of the row's stored keys.
    pub fn polled_keys(&self, row: &Subscription) -> Vec<String> {
        row.polled_keys(self.polled_keys_limit)
    }

    pub fn polling_info_for_triggers(&self, account_id: &str, id: &str) -> Result<PollingInfoForTriggers> {
        let row = self
            .db
            .get(account_id, id)?
            .ok_or_else(|| PerpetualError::SubscriptionNotFound(id.to_string()))?;
        Ok(PollingInfoForTriggers {
            subscription_id: row.id,
            polled_keys: row.polled_keys,
            perpetual_task_id: row.perpetual_task_id,
        })
    }

    // -----------------------------------------------------------------------
    // Field updates
    // -----------------------------------------------------------------------

    pub fn attach_perpetual_task(&self, account_id: &str, id: &str, task_id: &str) -> Result<bool> {
        let updated = self
            .db
            .modify(account_id, id, |r| r.perpetual_task_id = Some(task_id.to_string()))?;
        Ok(updated.is_some())
    }

    pub fn update_failed_attempts(&self, account_id: &str, id: &str, failed_attempts: u32) -> Result<bool> {
        let updated = self
            .db
            .modify(account_id, id, |r| r.failed_attempts = failed_attempts)?;
        Ok(updated.is_some())
    }

    pub fn update_polled_response(&self, account_id: &str, id: &str, keys: Vec<String>) -> Result<bool> {
        let updated = self.db.modify(account_id, id, |r| {
            r.polled_keys = keys;
            r.last_modified_polled_response_at = Some(Utc::now());
        })?;
        Ok(updated.is_some())
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Drop every row at exactly `scope`. Observers are not called; this is
    /// for org/project teardown, where tasks are cleaned up separately.
    pub fn delete_at_all_scopes(&self, scope: &Scope) -> Result<usize> {
        let removed = self.db.delete_scope(scope)?;
        tracing::info!(scope = %scope, removed, "deleted subscriptions at scope");
        Ok(removed)
    }

    /// Reset the task of every row watching `connector_ref`, e.g. after its
    /// credentials rotated. Returns the number of rows touched.
    pub fn reset_tasks_for_connector(&self, account_id: &str, connector_ref: &str) -> Result<usize> {
        let rows = self.by_connector(account_id, connector_ref)?;
        for row in &rows {
            self.notify(Lifecycle::Updated, row);
        }
        Ok(rows.len())
    }

    /// Push a poll outcome to the trigger service. Best-effort: any failure
    /// is logged and reported as `false`.
    pub fn update_trigger_polling_status(
        &self,
        account_id: &str,
        signatures: Vec<String>,
        success: bool,
        error_message: &str,
        mut last_collected_versions: Vec<String>,
        error_status_valid_for: Option<Duration>,
    ) -> bool {
        last_collected_versions.truncate(self.polled_keys_limit);
        let now = Utc::now();
        let error_status_valid_until = error_status_valid_for
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        let update = TriggerStatusUpdate {
            account_id: account_id.to_string(),
            signatures,
            success,
            error_message: error_message.to_string(),
            last_collected_versions,
            last_collected_at: now,
            error_status_valid_until,
        };
        match self.triggers.publish(update) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(account = %account_id, error = %e, "failed to update trigger polling status");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Observer fan-out
    // -----------------------------------------------------------------------

    fn notify(&self, event: Lifecycle, row: &Subscription) {
        for observer in &self.observers {
            let result = match event {
                Lifecycle::Saved => observer.on_saved(row),
                Lifecycle::Updated => observer.on_updated(row),
                Lifecycle::Deleted => observer.on_deleted(row),
            };
            if let Err(e) = result {
                tracing::error!(
                    subscription_id = %row.id,
                    event = ?event,
                    error = %e,
                    "subscription observer failed; mutation kept"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::SubscriptionType;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl Recorder {
        fn record(&self, kind: &str, row: &Subscription) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((kind.to_string(), row.id.clone()));
            if self.fail {
                Err(PerpetualError::Scheduler("scheduler down".into()))
            } else {
                Ok(())
            }
        }

        fn count(&self, kind: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == kind)
                .count()
        }
    }

    impl SubscriptionObserver for Recorder {
        fn on_saved(&self, row: &Subscription) -> Result<()> {
            self.record("saved", row)
        }
        fn on_updated(&self, row: &Subscription) -> Result<()> {
            self.record("updated", row)
        }
        fn on_deleted(&self, row: &Subscription) -> Result<()> {
            self.record("deleted", row)
        }
    }

    struct FailingSink;

    impl TriggerStatusSink for FailingSink {
        fn publish(&self, _update: TriggerStatusUpdate) -> Result<bool> {
            Err(PerpetualError::Store("unreachable".into()))
        }
    }

    struct CapturingSink(Mutex<Vec<TriggerStatusUpdate>>);

    impl TriggerStatusSink for CapturingSink {
        fn publish(&self, update: TriggerStatusUpdate) -> Result<bool> {
            self.0.lock().unwrap().push(update);
            Ok(true)
        }
    }

    fn open_tmp(recorder: Arc<Recorder>) -> (TempDir, SubscriptionRegistry) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("registry.redb")).unwrap();
        let registry = SubscriptionRegistry::new(SubscriptionDb::new(store).unwrap(), 10)
            .with_observer(recorder);
        (dir, registry)
    }

    fn request(sig: &str, image: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(
            Scope::account("acctA"),
            SubscriptionType::Artifact,
            json!({"connectorRef": "docker", "imagePath": image}),
            [sig],
        )
    }

    fn sigs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn save_twice_yields_one_row_with_union() {
        let recorder = Arc::new(Recorder::default());
        let (_dir, registry) = open_tmp(recorder.clone());

        let first = registry.save(request("s1", "nginx")).unwrap();
        assert!(!first.existing);
        let second = registry.save(request("s2", "nginx")).unwrap();
        assert!(second.existing);
        assert_eq!(second.subscription_id, first.subscription_id);

        let row = registry.get("acctA", &first.subscription_id).unwrap().unwrap();
        assert_eq!(row.signatures, sigs(&["s1", "s2"]));
        assert_eq!(recorder.count("saved"), 1);
        assert_eq!(recorder.count("updated"), 0);
    }

    #[test]
    fn save_ignores_client_supplied_id() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let out = registry.save(request("s1", "nginx").with_id("stale-id")).unwrap();
        assert_ne!(out.subscription_id, "stale-id");
    }

    #[test]
    fn save_rejects_missing_account() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let mut req = request("s1", "nginx");
        req.scope = Scope::account("");
        assert!(matches!(registry.save(req), Err(PerpetualError::Validation(_))));
    }

    #[test]
    fn unsubscribe_deletes_only_when_last_owner_leaves() {
        let recorder = Arc::new(Recorder::default());
        let (_dir, registry) = open_tmp(recorder.clone());
        let id = registry.save(request("A", "nginx")).unwrap().subscription_id;
        registry.save(request("B", "nginx")).unwrap();

        assert!(registry.unsubscribe("acctA", &id, &sigs(&["A"])).unwrap());
        let row = registry.get("acctA", &id).unwrap().unwrap();
        assert_eq!(row.signatures, sigs(&["B"]));
        assert_eq!(recorder.count("deleted"), 0);

        assert!(registry.unsubscribe("acctA", &id, &sigs(&["B"])).unwrap());
        assert!(registry.get("acctA", &id).unwrap().is_none());
        assert_eq!(recorder.count("deleted"), 1);

        assert!(!registry.unsubscribe("acctA", &id, &sigs(&["B"])).unwrap());
        assert_eq!(recorder.count("deleted"), 1);
    }

    #[test]
    fn subscribe_with_unchanged_target_is_a_refresh() {
        let recorder = Arc::new(Recorder::default());
        let (_dir, registry) = open_tmp(recorder.clone());
        let id = registry.save(request("s1", "nginx")).unwrap().subscription_id;

        let out = registry.subscribe(request("s1", "nginx").with_id(&id)).unwrap();
        assert!(out.existing);
        assert_eq!(out.subscription_id, id);
        assert_eq!(recorder.count("saved"), 1);
    }

    #[test]
    fn subscribe_with_changed_target_moves_to_new_row() {
        let recorder = Arc::new(Recorder::default());
        let (_dir, registry) = open_tmp(recorder.clone());
        let old = registry.save(request("s1", "nginx")).unwrap().subscription_id;

        let out = registry.subscribe(request("s1", "redis").with_id(&old)).unwrap();
        assert!(!out.existing);
        assert_ne!(out.subscription_id, old);
        assert!(registry.get("acctA", &old).unwrap().is_none());
        assert_eq!(recorder.count("deleted"), 1);
        assert_eq!(recorder.count("saved"), 2);
    }

    #[test]
    fn subscribe_with_foreign_id_falls_back_to_save() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let id = registry.save(request("s1", "nginx")).unwrap().subscription_id;
        // s2 does not own `id`, so the id is ignored and s2 joins by identity.
        let out = registry.subscribe(request("s2", "nginx").with_id(&id)).unwrap();
        assert!(out.existing);
        assert_eq!(out.subscription_id, id);
    }

    #[test]
    fn observer_failure_does_not_roll_back() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let (_dir, registry) = open_tmp(recorder.clone());
        let out = registry.save(request("s1", "nginx")).unwrap();
        assert!(registry.get("acctA", &out.subscription_id).unwrap().is_some());
        assert_eq!(recorder.count("saved"), 1);
    }

    #[test]
    fn existing_save_reports_capped_polled_keys_and_poll_time() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let id = registry.save(request("s1", "nginx")).unwrap().subscription_id;
        let keys: Vec<String> = (0..30).map(|i| format!("1.{i}")).collect();
        assert!(registry.update_polled_response("acctA", &id, keys.clone()).unwrap());

        let out = registry.save(request("s2", "nginx")).unwrap();
        assert_eq!(out.last_polled.len(), 10);
        let row = registry.get("acctA", &id).unwrap().unwrap();
        assert_eq!(out.last_update, row.last_modified_polled_response_at);

        let info = registry.polling_info_for_triggers("acctA", &id).unwrap();
        assert_eq!(info.polled_keys, keys);
    }

    #[test]
    fn oversized_polled_keys_limit_is_clamped() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("r.redb")).unwrap();
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let registry = SubscriptionRegistry::new(SubscriptionDb::new(store).unwrap(), 50)
            .with_trigger_sink(sink.clone());
        let id = registry.save(request("s1", "nginx")).unwrap().subscription_id;
        let keys: Vec<String> = (0..30).map(|i| format!("1.{i}")).collect();
        registry.update_polled_response("acctA", &id, keys.clone()).unwrap();

        let out = registry.save(request("s2", "nginx")).unwrap();
        assert_eq!(out.last_polled.len(), 10);

        registry.update_trigger_polling_status("acctA", vec![], true, "", keys, None);
        assert_eq!(sink.0.lock().unwrap()[0].last_collected_versions.len(), 10);
    }

    #[test]
    fn polling_info_for_missing_row_is_not_found() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let err = registry.polling_info_for_triggers("acctA", "nope").unwrap_err();
        assert!(matches!(err, PerpetualError::SubscriptionNotFound(_)));
    }

    #[test]
    fn connector_reset_fires_update_per_row() {
        let recorder = Arc::new(Recorder::default());
        let (_dir, registry) = open_tmp(recorder.clone());
        registry.save(request("s1", "nginx")).unwrap();
        registry.save(request("s1", "redis")).unwrap();
        let touched = registry.reset_tasks_for_connector("acctA", "docker").unwrap();
        assert_eq!(touched, 2);
        assert_eq!(recorder.count("updated"), 2);
        assert_eq!(registry.reset_tasks_for_connector("acctA", "gcr").unwrap(), 0);
    }

    #[test]
    fn ids_by_signatures_and_get_many() {
        let (_dir, registry) = open_tmp(Arc::new(Recorder::default()));
        let a = registry.save(request("s1", "nginx")).unwrap().subscription_id;
        let b = registry.save(request("s2", "redis")).unwrap().subscription_id;
        assert_eq!(registry.ids_by_signatures("acctA", &sigs(&["s2"])).unwrap(), vec![b.clone()]);
        let many = registry
            .get_many("acctA", &[a.clone(), "missing".into(), b.clone()])
            .unwrap();
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn trigger_status_is_truncated_and_best_effort() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("r.redb")).unwrap();
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let registry = SubscriptionRegistry::new(SubscriptionDb::new(store.clone()).unwrap(), 10)
            .with_trigger_sink(sink.clone());

        let versions = (0..15).map(|i| i.to_string()).collect();
        assert!(registry.update_trigger_polling_status(
            "acctA",
            vec!["sig".into()],
            false,
            "boom",
            versions,
            Some(Duration::from_secs(120)),
        ));
        let sent = sink.0.lock().unwrap()[0].clone();
        assert_eq!(sent.last_collected_versions.len(), 10);
        assert_eq!(
            sent.error_status_valid_until,
            Some(sent.last_collected_at + chrono::Duration::seconds(120))
        );

        let failing = SubscriptionRegistry::new(SubscriptionDb::new(store).unwrap(), 10)
            .with_trigger_sink(Arc::new(FailingSink));
        assert!(!failing.update_trigger_polling_status("acctA", vec![], true, "", vec![], None));
    }
}

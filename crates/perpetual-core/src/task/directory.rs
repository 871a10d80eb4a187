use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::registry::{Subscription, SubscriptionDb, SubscriptionObserver};
use crate::task::PerpetualTaskScheduler;

/// Keeps one perpetual task alive per subscription row.
///
/// Registered on the [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry)
/// as an observer: a new row gets a task, an updated row has its task reset,
/// a deleted row has its task deleted.
pub struct PerpetualTaskDirectory {
    scheduler: Arc<dyn PerpetualTaskScheduler>,
    subscriptions: SubscriptionDb,
}

impl PerpetualTaskDirectory {
    pub fn new(scheduler: Arc<dyn PerpetualTaskScheduler>, subscriptions: SubscriptionDb) -> Self {
        Self {
            scheduler,
            subscriptions,
        }
    }

    fn create_for(&self, row: &Subscription) -> Result<()> {
        let task_type = row.kind.task_type();
        let task_id = self.scheduler.create_perpetual_task(
            &row.scope.account_id,
            task_type,
            task_type.schedule(),
            &client_context(row),
        )?;
        let attached = self
            .subscriptions
            .modify(&row.scope.account_id, &row.id, |r| {
                r.perpetual_task_id = Some(task_id.clone())
            })?
            .is_some();
        if !attached {
            // Row vanished between create and attach (concurrent unsubscribe).
            tracing::warn!(subscription_id = %row.id, task_id = %task_id, "subscription gone; deleting orphan task");
            self.scheduler.delete_task(&row.scope.account_id, &task_id)?;
        }
        Ok(())
    }
}

/// Context a worker needs to poll on behalf of `row`.
fn client_context(row: &Subscription) -> Value {
    json!({
        "subscription_id": row.id,
        "scope": row.scope,
        "type": row.kind,
        "polling_info": row.polling_info,
    })
}

impl SubscriptionObserver for PerpetualTaskDirectory {
    fn on_saved(&self, row: &Subscription) -> Result<()> {
        self.create_for(row)
    }

    fn on_updated(&self, row: &Subscription) -> Result<()> {
        match &row.perpetual_task_id {
            Some(task_id) => {
                self.scheduler
                    .reset_perpetual_task(&row.scope.account_id, task_id, Some(&client_context(row)))
            }
            None => self.create_for(row),
        }
    }

    fn on_deleted(&self, row: &Subscription) -> Result<()> {
        if let Some(task_id) = &row.perpetual_task_id {
            let existed = self.scheduler.delete_task(&row.scope.account_id, task_id)?;
            if !existed {
                tracing::warn!(subscription_id = %row.id, task_id = %task_id, "perpetual task already gone");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SubscriptionRegistry, SubscriptionRequest};
    use crate::store::Store;
    use crate::task::TaskDb;
    use crate::types::{PerpetualTaskType, Scope, SubscriptionType};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        registry: SubscriptionRegistry,
        tasks: TaskDb,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("cp.redb")).unwrap();
        let subs = SubscriptionDb::new(store.clone()).unwrap();
        let tasks = TaskDb::new(store).unwrap();
        let directory = PerpetualTaskDirectory::new(Arc::new(tasks.clone()), subs.clone());
        let registry = SubscriptionRegistry::new(subs, 10).with_observer(Arc::new(directory));
        Harness {
            _dir: dir,
            registry,
            tasks,
        }
    }

    fn request(sig: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(
            Scope::account("acctA"),
            SubscriptionType::Artifact,
            json!({"connectorRef": "docker", "imagePath": "X"}),
            [sig],
        )
    }

    fn sigs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn subscribe_share_unsubscribe_end_to_end() {
        let h = harness();

        let first = h.registry.subscribe(request("s1")).unwrap();
        assert!(!first.existing);
        let t1 = first.perpetual_task_id.clone().expect("task attached");
        let task = h.tasks.get(&t1).unwrap().unwrap();
        assert_eq!(task.task_type, PerpetualTaskType::ArtifactCollection);
        assert_eq!(task.client_context["subscription_id"], first.subscription_id.as_str());

        let second = h.registry.subscribe(request("s2")).unwrap();
        assert!(second.existing);
        assert_eq!(second.subscription_id, first.subscription_id);
        assert_eq!(second.perpetual_task_id.as_deref(), Some(t1.as_str()));
        assert_eq!(h.tasks.list("acctA").unwrap().len(), 1);

        let id = first.subscription_id;
        h.registry.unsubscribe("acctA", &id, &sigs(&["s1"])).unwrap();
        let row = h.registry.get("acctA", &id).unwrap().unwrap();
        assert_eq!(row.signatures, sigs(&["s2"]));
        assert!(h.tasks.get(&t1).unwrap().is_some());

        h.registry.unsubscribe("acctA", &id, &sigs(&["s2"])).unwrap();
        assert!(h.registry.get("acctA", &id).unwrap().is_none());
        assert!(h.tasks.get(&t1).unwrap().is_none());
    }

    #[test]
    fn connector_reset_keeps_task_id() {
        let h = harness();
        let out = h.registry.save(request("s1")).unwrap();
        let task_id = out.perpetual_task_id.unwrap();
        h.tasks.mark_run(&task_id, chrono::Utc::now()).unwrap();

        h.registry.reset_tasks_for_connector("acctA", "docker").unwrap();
        let task = h.tasks.get(&task_id).unwrap().unwrap();
        assert!(task.last_run_at.is_none(), "reset makes the task due again");
        assert_eq!(h.tasks.list("acctA").unwrap().len(), 1);
    }

    #[test]
    fn changed_target_replaces_task() {
        let h = harness();
        let old = h.registry.save(request("s1")).unwrap();
        let mut changed = request("s1").with_id(&old.subscription_id);
        changed.polling_info = json!({"connectorRef": "docker", "imagePath": "Y"});
        let new = h.registry.subscribe(changed).unwrap();

        let old_task = old.perpetual_task_id.unwrap();
        assert!(h.tasks.get(&old_task).unwrap().is_none());
        let new_task = new.perpetual_task_id.unwrap();
        assert_ne!(new_task, old_task);
        assert!(h.tasks.get(&new_task).unwrap().is_some());
    }
}

//! redb-backed perpetual task records.
//!
//! `perpetual_tasks`: task id → [`PerpetualTask`] (JSON). Scans are linear;
//! a control plane serves a bounded number of tasks per account.

use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{db_err, PerpetualError, Result};
use crate::store::{encode, read_json, scan_json, JsonTable, Store};
use crate::task::{PerpetualTask, PerpetualTaskScheduler};
use crate::types::{PerpetualTaskType, Schedule};

const TASKS: JsonTable = TableDefinition::new("perpetual_tasks");

#[derive(Clone)]
pub struct TaskDb {
    store: Store,
}

impl TaskDb {
    pub fn new(store: Store) -> Result<Self> {
        store.ensure_table(TASKS)?;
        Ok(Self { store })
    }

    pub fn get(&self, task_id: &str) -> Result<Option<PerpetualTask>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let table = rt.open_table(TASKS).map_err(db_err)?;
        read_json(&table, task_id)
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<PerpetualTask>> {
        let rt = self.store.db().begin_read().map_err(db_err)?;
        let table = rt.open_table(TASKS).map_err(db_err)?;
        let mut tasks: Vec<PerpetualTask> = scan_json::<PerpetualTask, _>(&table)?
            .into_iter()
            .filter(|t| t.account_id == account_id)
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Tasks in `account_id` that `worker_id` may pick up at `now`.
    pub fn assignable(&self, account_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<Vec<PerpetualTask>> {
        Ok(self
            .list(account_id)?
            .into_iter()
            .filter(|t| t.is_assignable_to(worker_id, now))
            .collect())
    }

    /// Hand `task_id` to `worker_id`. Re-assigning to the current holder is
    /// allowed so a repeated acquire stays idempotent.
    pub fn assign(&self, task_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<Option<PerpetualTask>> {
        self.update(task_id, |task| {
            if !task.is_assignable_to(worker_id, now) {
                return false;
            }
            task.assigned_worker = Some(worker_id.to_string());
            task.assigned_at = Some(now);
            true
        })
    }

    pub fn mark_run(&self, task_id: &str, now: DateTime<Utc>) -> Result<PerpetualTask> {
        self.update(task_id, |task| {
            task.last_run_at = Some(now);
            true
        })?
        .ok_or_else(|| PerpetualError::TaskNotFound(task_id.to_string()))
    }

    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<PerpetualTask> {
        self.update(task_id, |task| {
            task.enabled = enabled;
            true
        })?
        .ok_or_else(|| PerpetualError::TaskNotFound(task_id.to_string()))
    }

    /// Read-modify-write in one transaction. `f` returns false to leave the
    /// row untouched; the result is then `None`.
    fn update<F>(&self, task_id: &str, f: F) -> Result<Option<PerpetualTask>>
    where
        F: FnOnce(&mut PerpetualTask) -> bool,
    {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let result = {
            let mut table = wt.open_table(TASKS).map_err(db_err)?;
            let current: Option<PerpetualTask> = read_json(&table, task_id)?;
            match current {
                Some(mut task) => {
                    if f(&mut task) {
                        table.insert(task_id, encode(&task)?.as_slice()).map_err(db_err)?;
                        Some(task)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(result)
    }
}

impl PerpetualTaskScheduler for TaskDb {
    fn create_perpetual_task(
        &self,
        account_id: &str,
        task_type: PerpetualTaskType,
        schedule: Schedule,
        client_context: &Value,
    ) -> Result<String> {
        let task = PerpetualTask {
            id: Uuid::new_v4().to_string(),
            task_type,
            schedule,
            client_context: client_context.clone(),
            account_id: account_id.to_string(),
            assigned_worker: None,
            assigned_at: None,
            last_run_at: None,
            enabled: true,
            created_at: Utc::now(),
        };
        let wt = self.store.db().begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(TASKS).map_err(db_err)?;
            table.insert(task.id.as_str(), encode(&task)?.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        tracing::info!(task_id = %task.id, account = %account_id, task_type = %task_type, "perpetual task created");
        Ok(task.id)
    }

    fn reset_perpetual_task(&self, account_id: &str, task_id: &str, client_context: Option<&Value>) -> Result<()> {
        let reset = self.update(task_id, |task| {
            if task.account_id != account_id {
                return false;
            }
            task.schedule = task.task_type.schedule();
            if let Some(ctx) = client_context {
                task.client_context = ctx.clone();
            }
            task.assigned_worker = None;
            task.assigned_at = None;
            task.last_run_at = None;
            true
        })?;
        match reset {
            Some(_) => {
                tracing::debug!(task_id, "perpetual task reset");
                Ok(())
            }
            None => Err(PerpetualError::TaskNotFound(task_id.to_string())),
        }
    }

    fn delete_task(&self, account_id: &str, task_id: &str) -> Result<bool> {
        let wt = self.store.db().begin_write().map_err(db_err)?;
        let deleted = {
            let mut table = wt.open_table(TASKS).map_err(db_err)?;
            let current: Option<PerpetualTask> = read_json(&table, task_id)?;
            match current {
                Some(task) if task.account_id == account_id => {
                    table.remove(task_id).map_err(db_err)?;
                    true
                }
                _ => false,
            }
        };
        wt.commit().map_err(db_err)?;
        if deleted {
            tracing::info!(task_id, account = %account_id, "perpetual task deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, TaskDb) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("tasks.redb")).unwrap();
        (dir, TaskDb::new(store).unwrap())
    }

    fn create(db: &TaskDb, account: &str) -> String {
        let kind = PerpetualTaskType::ArtifactCollection;
        db.create_perpetual_task(account, kind, kind.schedule(), &json!({"image": "nginx"}))
            .unwrap()
    }

    #[test]
    fn create_then_get() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        let task = db.get(&id).unwrap().unwrap();
        assert_eq!(task.account_id, "acct");
        assert!(task.enabled);
        assert_eq!(task.client_context["image"], "nginx");
    }

    #[test]
    fn reset_keeps_id_replaces_context_and_clears_assignment() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        let now = Utc::now();
        db.assign(&id, "w1", now).unwrap().unwrap();
        db.mark_run(&id, now).unwrap();

        db.reset_perpetual_task("acct", &id, Some(&json!({"image": "redis"})))
            .unwrap();
        let task = db.get(&id).unwrap().unwrap();
        assert_eq!(task.client_context["image"], "redis");
        assert!(task.assigned_worker.is_none());
        assert!(task.is_assignable_to("w2", now));
    }

    #[test]
    fn reset_of_unknown_or_foreign_task_fails() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        assert!(matches!(
            db.reset_perpetual_task("other", &id, None),
            Err(PerpetualError::TaskNotFound(_))
        ));
        assert!(db.reset_perpetual_task("acct", "missing", None).is_err());
    }

    #[test]
    fn delete_is_account_scoped() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        assert!(!db.delete_task("other", &id).unwrap());
        assert!(db.delete_task("acct", &id).unwrap());
        assert!(!db.delete_task("acct", &id).unwrap());
        assert!(db.get(&id).unwrap().is_none());
    }

    #[test]
    fn assign_respects_lease_and_schedule() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        let now = Utc::now();
        assert_eq!(db.assignable("acct", "w1", now).unwrap().len(), 1);

        db.assign(&id, "w1", now).unwrap().unwrap();
        assert!(db.assign(&id, "w1", now).unwrap().is_some(), "re-acquire by holder");
        assert!(db.assign(&id, "w2", now).unwrap().is_none());

        db.mark_run(&id, now).unwrap();
        assert!(db.assignable("acct", "w1", now).unwrap().is_empty());
        let later = now + Duration::seconds(121);
        assert_eq!(db.assignable("acct", "w2", later).unwrap().len(), 1);
        assert!(db.assignable("other", "w2", later).unwrap().is_empty());
    }

    #[test]
    fn disabled_tasks_are_not_assignable() {
        let (_dir, db) = open_tmp();
        let id = create(&db, "acct");
        db.set_enabled(&id, false).unwrap();
        assert!(db.assignable("acct", "w1", Utc::now()).unwrap().is_empty());
    }
}

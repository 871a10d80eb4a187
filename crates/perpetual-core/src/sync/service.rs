use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::batch::DetailBatch;
use crate::config::{BatchConfig, LockConfig};
use crate::error::{PerpetualError, Result};
use crate::lock::ResourceLocker;
use crate::sync::{
    BatchCursor, DeploymentEvent, ExecutionStatus, ReleaseIdentifier, SyncAction, SyncDetailDb, SyncOutcome,
    SyncReport, SyncTaskDetail,
};
use crate::task::PerpetualTaskScheduler;
use crate::types::PerpetualTaskType;

const LOCK_KIND: &str = "instance-sync";

/// Per-report tally returned to the reporting worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub processed: usize,
    /// Detail ids skipped: unknown, bound to another task, or locked.
    pub skipped: Vec<String>,
    pub updated_releases: usize,
    pub removed_releases: usize,
}

/// Reconciles deployment events and worker sync reports into
/// [`SyncTaskDetail`] rows.
pub struct SyncTaskService {
    details: SyncDetailDb,
    scheduler: Arc<dyn PerpetualTaskScheduler>,
    locker: ResourceLocker,
    lock: LockConfig,
    batch: BatchConfig,
}

impl SyncTaskService {
    pub fn new(
        details: SyncDetailDb,
        scheduler: Arc<dyn PerpetualTaskScheduler>,
        locker: ResourceLocker,
        lock: LockConfig,
        batch: BatchConfig,
    ) -> Self {
        Self {
            details,
            scheduler,
            locker,
            lock,
            batch,
        }
    }

    pub fn details(&self) -> &SyncDetailDb {
        &self.details
    }

    /// Record the releases of a finished deployment.
    ///
    /// Under the resource lock: merge into the resource's row if there is
    /// one; otherwise attach a new row to a task already serving the same
    /// owner; otherwise create a task and a row. One task may therefore
    /// track many resources.
    ///
    /// A lock timeout is not an error: the event is dropped and the next
    /// periodic sync catches up.
    pub fn handle_deployment_event(&self, event: DeploymentEvent) -> Result<SyncOutcome> {
        event.scope.validate()?;
        if event.resource_key.trim().is_empty() {
            return Err(PerpetualError::validation("resource key must not be empty"));
        }
        let account = event.scope.account_id.clone();
        let resource = format!("{account}/{}", event.resource_key);

        let guard = match self.locker.acquire(
            LOCK_KIND,
            &resource,
            self.lock.wait_timeout(),
            self.lock.hold_timeout(),
        ) {
            Ok(guard) => guard,
            Err(PerpetualError::LockTimeout { resource }) => {
                tracing::warn!(resource = %resource, "lock timeout; dropping deployment event");
                return Ok(SyncOutcome {
                    action: SyncAction::Dropped,
                    detail_id: None,
                    perpetual_task_id: None,
                });
            }
            Err(e) => return Err(e),
        };

        let outcome = self.reconcile(event)?;
        guard.release()?;
        Ok(outcome)
    }

    fn reconcile(&self, event: DeploymentEvent) -> Result<SyncOutcome> {
        let account = event.scope.account_id.as_str();

        if let Some(row) = self.details.find_by_resource(account, &event.resource_key)? {
            let merged = self
                .details
                .merge(&row.id, &event.releases)?
                .ok_or_else(|| PerpetualError::DetailNotFound(row.id.clone()))?;
            self.scheduler
                .reset_perpetual_task(account, &merged.perpetual_task_id, None)?;
            tracing::debug!(detail_id = %merged.id, releases = merged.releases.len(), "merged deployment into existing detail");
            return Ok(SyncOutcome {
                action: SyncAction::Merged,
                detail_id: Some(merged.id),
                perpetual_task_id: Some(merged.perpetual_task_id),
            });
        }

        let (task_id, action) = match self.details.find_by_owner(account, &event.owner_key)? {
            Some(sibling) => (sibling.perpetual_task_id, SyncAction::Attached),
            None => {
                let task_type = PerpetualTaskType::InstanceSync;
                let context = json!({
                    "account_id": account,
                    "owner_key": event.owner_key,
                    "context": event.client_context,
                });
                let task_id = self.scheduler.create_perpetual_task(
                    account,
                    task_type,
                    task_type.schedule(),
                    &context,
                )?;
                (task_id, SyncAction::Created)
            }
        };

        let detail = SyncTaskDetail {
            id: Uuid::new_v4().to_string(),
            scope: event.scope.clone(),
            resource_key: event.resource_key.clone(),
            owner_key: event.owner_key.clone(),
            perpetual_task_id: task_id.clone(),
            releases: crate::sync::merge_releases(&[], &event.releases),
            last_run_at: None,
            created_at: Utc::now(),
            cursor: BatchCursor::default(),
        };
        let (row, _) = self.details.insert_or_merge(detail)?;
        if action == SyncAction::Attached {
            self.scheduler.reset_perpetual_task(account, &task_id, None)?;
        }
        tracing::info!(
            detail_id = %row.id,
            task_id = %task_id,
            resource = %event.resource_key,
            action = ?action,
            "sync detail bound to task"
        );
        Ok(SyncOutcome {
            action,
            detail_id: Some(row.id),
            perpetual_task_id: Some(task_id),
        })
    }

    /// Bounded view of every row bound to `perpetual_task_id`.
    ///
    /// Each call serves the next page of every row, so a row larger than
    /// the batch limits is covered in full over repeated calls.
    pub fn fetch_task_details(&self, account_id: &str, perpetual_task_id: &str) -> Result<Vec<DetailBatch>> {
        let mut batches = Vec::new();
        for detail in self.details.list_for_task(perpetual_task_id)? {
            if detail.scope.account_id != account_id {
                continue;
            }
            if let Some(batch) = self.details.next_batch(&detail.id, &self.batch)? {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    /// Fold a worker's report into the rows it covers.
    ///
    /// Rows held by a concurrent deployment event are skipped rather than
    /// waited on; the next scheduled run reports them again.
    pub fn process_sync_result(
        &self,
        account_id: &str,
        perpetual_task_id: &str,
        report: &SyncReport,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        if report.status == ExecutionStatus::Failure {
            tracing::warn!(
                task_id = perpetual_task_id,
                error = report.error_message.as_deref().unwrap_or(""),
                "instance sync run failed"
            );
            return Ok(summary);
        }

        let mut by_detail: BTreeMap<&str, Vec<ReleaseIdentifier>> = BTreeMap::new();
        for data in &report.instances {
            by_detail
                .entry(data.detail_id.as_str())
                .or_default()
                .extend(data.releases.iter().cloned());
        }

        let now = Utc::now();
        for (detail_id, releases) in by_detail {
            let Some(row) = self.details.get(detail_id)? else {
                tracing::warn!(detail_id, "sync report for unknown detail");
                summary.skipped.push(detail_id.to_string());
                continue;
            };
            if row.perpetual_task_id != perpetual_task_id || row.scope.account_id != account_id {
                tracing::warn!(detail_id, task_id = perpetual_task_id, "sync report for detail bound elsewhere");
                summary.skipped.push(detail_id.to_string());
                continue;
            }
            let resource = format!("{account_id}/{}", row.resource_key);
            let Some(_guard) = self
                .locker
                .try_acquire(LOCK_KIND, &resource, self.lock.hold_timeout())?
            else {
                tracing::debug!(detail_id, resource = %resource, "detail busy; deferring report");
                summary.skipped.push(detail_id.to_string());
                continue;
            };
            let Some(applied) = self.details.apply_report(detail_id, &releases, now)? else {
                summary.skipped.push(detail_id.to_string());
                continue;
            };
            summary.processed += 1;
            summary.updated_releases += applied.updated.len();
            summary.removed_releases += applied.removed.len();
            self.update_last_run(detail_id, &applied.updated, &applied.removed);
        }
        Ok(summary)
    }

    /// Stamp the row's last run. Best-effort: failures are logged only.
    pub fn update_last_run(&self, detail_id: &str, updated: &[String], removed: &[String]) -> bool {
        match self.details.set_last_run(detail_id, Utc::now()) {
            Ok(true) => {
                tracing::debug!(detail_id, updated = updated.len(), removed = removed.len(), "sync detail processed");
                true
            }
            Ok(false) => {
                tracing::warn!(detail_id, "cannot stamp last run; detail missing");
                false
            }
            Err(e) => {
                tracing::error!(detail_id, error = %e, "failed to update last run");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::sync::InstanceData;
    use crate::task::TaskDb;
    use crate::types::Scope;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        service: SyncTaskService,
        tasks: TaskDb,
        locker: ResourceLocker,
    }

    fn harness(lock: LockConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("sync.redb")).unwrap();
        let tasks = TaskDb::new(store.clone()).unwrap();
        let locker = ResourceLocker::new(store.clone(), &lock).unwrap();
        let service = SyncTaskService::new(
            SyncDetailDb::new(store).unwrap(),
            Arc::new(tasks.clone()),
            locker.clone(),
            lock,
            BatchConfig::default(),
        );
        Harness {
            _dir: dir,
            service,
            tasks,
            locker,
        }
    }

    fn event(resource: &str, owner: &str, releases: &[(&str, &[&str])]) -> DeploymentEvent {
        DeploymentEvent {
            scope: Scope::account("acct"),
            resource_key: resource.into(),
            owner_key: owner.into(),
            releases: releases
                .iter()
                .map(|(k, inst)| ReleaseIdentifier::new(*k).with_instances(inst.iter().copied()))
                .collect(),
            client_context: json!({"infra": owner}),
        }
    }

    #[test]
    fn first_event_creates_task_and_detail() {
        let h = harness(LockConfig::default());
        let out = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &["i1"])]))
            .unwrap();
        assert_eq!(out.action, SyncAction::Created);
        let task = h.tasks.get(out.perpetual_task_id.as_deref().unwrap()).unwrap().unwrap();
        assert_eq!(task.task_type, PerpetualTaskType::InstanceSync);
    }

    #[test]
    fn repeat_event_merges_into_same_row() {
        let h = harness(LockConfig::default());
        let first = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &["i1"])]))
            .unwrap();
        let second = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &["i2"]), ("r2", &[])]))
            .unwrap();
        assert_eq!(second.action, SyncAction::Merged);
        assert_eq!(second.detail_id, first.detail_id);
        let row = h.service.details().get(first.detail_id.as_deref().unwrap()).unwrap().unwrap();
        assert_eq!(row.releases.len(), 2);
        assert_eq!(row.release("r1").unwrap().instances.len(), 2);
    }

    #[test]
    fn one_task_serves_many_resources_of_same_owner() {
        let h = harness(LockConfig::default());
        let a = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &[])]))
            .unwrap();
        let b = h
            .service
            .handle_deployment_event(event("ns/b", "aws-1", &[("r2", &[])]))
            .unwrap();
        let c = h
            .service
            .handle_deployment_event(event("ns/c", "gcp-7", &[("r3", &[])]))
            .unwrap();

        assert_eq!(b.action, SyncAction::Attached);
        assert_eq!(a.perpetual_task_id, b.perpetual_task_id);
        assert_ne!(a.detail_id, b.detail_id);
        assert_eq!(c.action, SyncAction::Created);
        assert_ne!(c.perpetual_task_id, a.perpetual_task_id);

        let task_id = a.perpetual_task_id.unwrap();
        assert_eq!(h.service.details().list_for_task(&task_id).unwrap().len(), 2);
        assert_eq!(h.tasks.list("acct").unwrap().len(), 2);
    }

    #[test]
    fn held_lock_drops_event() {
        let h = harness(LockConfig {
            wait_timeout_secs: 0,
            poll_interval_ms: 1,
            ..LockConfig::default()
        });
        let _held = h
            .locker
            .try_acquire(LOCK_KIND, "acct/ns/a", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        let out = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &[])]))
            .unwrap();
        assert_eq!(out.action, SyncAction::Dropped);
        assert!(h.service.details().list("acct").unwrap().is_empty());
    }

    #[test]
    fn fetch_is_batched() {
        let h = harness(LockConfig::default());
        let releases: Vec<(String, Vec<String>)> = (0..7)
            .map(|r| (format!("r{r}"), (0..120).map(|i| format!("i{i:03}")).collect()))
            .collect();
        let ev = DeploymentEvent {
            releases: releases
                .iter()
                .map(|(k, inst)| ReleaseIdentifier::new(k.as_str()).with_instances(inst.iter().cloned()))
                .collect(),
            ..event("ns/a", "aws-1", &[])
        };
        let out = h.service.handle_deployment_event(ev).unwrap();

        let batches = h
            .service
            .fetch_task_details("acct", out.perpetual_task_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].truncated);
        assert_eq!(batches[0].releases.len(), 5);
        assert!(batches[0].releases.iter().all(|r| r.instances.len() <= 100));
        assert!(h.service.fetch_task_details("other", "nope").unwrap().is_empty());
    }

    #[test]
    fn repeated_fetches_cover_every_release() {
        let h = harness(LockConfig::default());
        let ev = DeploymentEvent {
            releases: (0..8).map(|r| ReleaseIdentifier::new(format!("r{r}"))).collect(),
            ..event("ns/a", "aws-1", &[])
        };
        let out = h.service.handle_deployment_event(ev).unwrap();
        let task_id = out.perpetual_task_id.unwrap();

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..2 {
            let batches = h.service.fetch_task_details("acct", &task_id).unwrap();
            assert_eq!(batches[0].releases.len(), 5);
            seen.extend(batches[0].releases.iter().map(|r| r.key.clone()));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn sync_report_groups_by_detail_and_stamps_last_run() {
        let h = harness(LockConfig::default());
        let out = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &["i1"])]))
            .unwrap();
        let task_id = out.perpetual_task_id.unwrap();
        let detail_id = out.detail_id.unwrap();

        let mut expired = ReleaseIdentifier::new("r1");
        expired.delete_after = Some(Utc::now() - chrono::Duration::minutes(5));
        let report = SyncReport {
            status: ExecutionStatus::Success,
            error_message: None,
            instances: vec![
                InstanceData {
                    detail_id: detail_id.clone(),
                    releases: vec![ReleaseIdentifier::new("r2").with_instances(["i7"])],
                },
                InstanceData {
                    detail_id: detail_id.clone(),
                    releases: vec![expired],
                },
                InstanceData {
                    detail_id: "ghost".into(),
                    releases: vec![],
                },
            ],
        };
        let summary = h.service.process_sync_result("acct", &task_id, &report).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.removed_releases, 1);
        assert_eq!(summary.skipped, vec!["ghost".to_string()]);

        let row = h.service.details().get(&detail_id).unwrap().unwrap();
        assert!(row.release("r1").is_none());
        assert!(row.release("r2").is_some());
        assert!(row.last_run_at.is_some());
    }

    #[test]
    fn failed_report_changes_nothing() {
        let h = harness(LockConfig::default());
        let out = h
            .service
            .handle_deployment_event(event("ns/a", "aws-1", &[("r1", &[])]))
            .unwrap();
        let report = SyncReport {
            status: ExecutionStatus::Failure,
            error_message: Some("kube api unreachable".into()),
            instances: vec![InstanceData {
                detail_id: out.detail_id.clone().unwrap(),
                releases: vec![],
            }],
        };
        let summary = h
            .service
            .process_sync_result("acct", out.perpetual_task_id.as_deref().unwrap(), &report)
            .unwrap();
        assert_eq!(summary, SyncSummary::default());
    }

    #[test]
    fn update_last_run_on_missing_detail_is_false() {
        let h = harness(LockConfig::default());
        assert!(!h.service.update_last_run("missing", &[], &[]));
    }
}

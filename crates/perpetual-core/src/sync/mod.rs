//! Instance-sync bookkeeping: which releases live on which resource, and
//! which perpetual task keeps each resource in sync.

mod db;
mod detail;
mod service;

pub use db::{AppliedReport, SyncDetailDb};
pub use detail::{
    merge_releases, BatchCursor, DeploymentEvent, ExecutionStatus, InstanceData, ReleaseIdentifier, SyncAction,
    SyncOutcome, SyncReport, SyncTaskDetail,
};
pub use service::{SyncSummary, SyncTaskService};

//! Perpetual task records and the directory that ties them to subscriptions.

mod db;
mod directory;
mod model;
mod scheduler;

pub use db::TaskDb;
pub use directory::PerpetualTaskDirectory;
pub use model::PerpetualTask;
pub use scheduler::PerpetualTaskScheduler;

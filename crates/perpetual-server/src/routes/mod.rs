pub mod subscriptions;
pub mod sync;
pub mod tasks;
pub mod workers;

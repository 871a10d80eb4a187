//! Subscription registry: deduplicated watch requests shared by signature.

mod db;
mod observer;
mod service;
mod subscription;

pub use db::{RemoveOutcome, SubscriptionDb};
pub use observer::{LoggingTriggerSink, SubscriptionObserver, TriggerStatusSink, TriggerStatusUpdate};
pub use service::SubscriptionRegistry;
pub use subscription::{
    identity_key, PollingInfoForTriggers, SaveOutcome, Subscription, SubscriptionRequest,
};

//! HTTP delivery of trigger polling status.
//!
//! The registry calls [`TriggerStatusSink::publish`] on the request path, so
//! this sink only enqueues. A background task drains the queue and POSTs
//! each update to the configured trigger service. Delivery is best-effort:
//! a full queue or a failed POST is logged and dropped.

use perpetual_core::registry::{TriggerStatusSink, TriggerStatusUpdate};
use perpetual_core::Result;
use tokio::sync::mpsc;

const QUEUE_DEPTH: usize = 256;

pub struct HttpTriggerSink {
    tx: mpsc::Sender<TriggerStatusUpdate>,
}

impl HttpTriggerSink {
    /// Spawn the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(url: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<TriggerStatusUpdate>(QUEUE_DEPTH);
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                deliver(&client, &url, &update).await;
            }
        });
        Self { tx }
    }
}

async fn deliver(client: &reqwest::Client, url: &str, update: &TriggerStatusUpdate) {
    let result = client.post(url).json(update).send().await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(account = %update.account_id, "trigger status delivered");
        }
        Ok(resp) => {
            tracing::warn!(account = %update.account_id, status = %resp.status(), "trigger service rejected status update");
        }
        Err(e) => {
            tracing::warn!(account = %update.account_id, error = %e, "trigger status delivery failed");
        }
    }
}

impl TriggerStatusSink for HttpTriggerSink {
    fn publish(&self, update: TriggerStatusUpdate) -> Result<bool> {
        match self.tx.try_send(update) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("trigger status queue full; dropping update");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("trigger status delivery task stopped");
                Ok(false)
            }
        }
    }
}

//! Publishing share events onto the notification bus.

use super::queue::{MessageQueue, QueueError};
use crate::models::notification::{Envelope, ShareEvent};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish `event`, returning the bus message id.
    async fn publish(&self, event: &ShareEvent) -> Result<String, NotifyError>;
}

/// Wraps events in the bus envelope and enqueues them.
pub struct QueueTopic {
    queue: Arc<dyn MessageQueue>,
}

impl QueueTopic {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl NotificationPublisher for QueueTopic {
    async fn publish(&self, event: &ShareEvent) -> Result<String, NotifyError> {
        let message_id = Uuid::new_v4().to_string();
        let envelope = Envelope::notification(message_id.clone(), serde_json::to_string(event)?);
        self.queue.send(serde_json::to_string(&envelope)?).await?;
        info!(
            transfer_id = %event.transfer_id,
            message_id = %message_id,
            recipients = event.emails.len(),
            "share event published"
        );
        Ok(message_id)
    }
}

//! Notification fan-out worker.
//!
//! Drains the share-event queue and sends one email per recipient. A message
//! is acknowledged when retrying it cannot help (undecodable payload, unknown
//! event, no recipients) or when at least one recipient was reached. If every
//! send failed it is left for redelivery, so recipients may see duplicates.

use super::mailer::{EmailSender, OutgoingEmail};
use super::queue::{MessageQueue, QueueError, ReceivedMessage};
use crate::models::notification::{Envelope, SHARE_SUBJECT, ShareEvent, TRANSFER_SHARED};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub from: String,
    pub batch: usize,
    pub wait: Duration,
    pub backoff: Duration,
    /// Bound on each individual send.
    pub send_timeout: Duration,
}

/// What processing a single message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The envelope itself could not be read.
    MalformedEnvelope,
    /// Permanently undeliverable.
    Discarded(&'static str),
    NoRecipients,
    Delivered { sent: usize, failed: usize },
    AllFailed { failed: usize },
}

impl Outcome {
    pub fn acknowledges(&self) -> bool {
        match self {
            Outcome::Discarded(_) | Outcome::NoRecipients | Outcome::Delivered { .. } => true,
            Outcome::MalformedEnvelope | Outcome::AllFailed { .. } => false,
        }
    }
}

pub struct NotificationWorker {
    queue: Arc<dyn MessageQueue>,
    mailer: Arc<dyn EmailSender>,
    settings: WorkerSettings,
}

impl NotificationWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        mailer: Arc<dyn EmailSender>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            mailer,
            settings,
        }
    }

    /// Poll until `shutdown` fires. Receive errors back off instead of
    /// spinning.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(batch = self.settings.batch, "notification worker started");
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_once() => polled,
            };
            if let Err(err) = polled {
                error!(error = %err, backoff = ?self.settings.backoff, "failed to receive notifications");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.backoff) => {}
                }
            }
        }
        info!("notification worker stopped");
    }

    /// Receive one batch and process it. Returns the number of messages
    /// handled.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .receive(self.settings.batch, self.settings.wait)
            .await?;
        let received = batch.len();
        for message in batch {
            self.handle(message).await;
        }
        Ok(received)
    }

    async fn handle(&self, message: ReceivedMessage) {
        let outcome = self.process(&message.body).await;
        debug!(
            message_id = %message.message_id,
            receive_count = message.receive_count,
            ?outcome,
            "processed notification"
        );
        if !outcome.acknowledges() {
            if message.receive_count > 1 {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "notification still undelivered after redelivery"
                );
            }
            return;
        }
        if let Err(err) = self.queue.delete(&message.receipt).await {
            warn!(message_id = %message.message_id, error = %err, "failed to acknowledge message");
        }
    }

    /// Decode a queue body and deliver the event it carries.
    pub async fn process(&self, body: &str) -> Outcome {
        let envelope: Envelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "unreadable envelope, leaving for redelivery");
                return Outcome::MalformedEnvelope;
            }
        };
        let event: ShareEvent = match serde_json::from_str(&envelope.message) {
            Ok(event) => event,
            Err(err) => {
                warn!(message_id = %envelope.message_id, error = %err, "discarding undecodable event");
                return Outcome::Discarded("undecodable event");
            }
        };
        if event.event_type != TRANSFER_SHARED {
            info!(event_type = %event.event_type, "discarding unknown event type");
            return Outcome::Discarded("unknown event type");
        }
        if event.emails.is_empty() {
            return Outcome::NoRecipients;
        }

        let body = event.email_body();
        let mut sent = 0;
        let mut failed = 0;
        for to in &event.emails {
            let email = OutgoingEmail {
                from: self.settings.from.clone(),
                to: to.clone(),
                subject: SHARE_SUBJECT.to_string(),
                body: body.clone(),
            };
            match tokio::time::timeout(self.settings.send_timeout, self.mailer.send(&email)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(transfer_id = %event.transfer_id, to = %to, error = %err, "email send failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(transfer_id = %event.transfer_id, to = %to, "email send timed out");
                }
            }
        }

        if sent == 0 {
            Outcome::AllFailed { failed }
        } else {
            Outcome::Delivered { sent, failed }
        }
    }
}

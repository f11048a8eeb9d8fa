//! Durable at-least-once message queue.
//!
//! Messages are claimed, not removed, by `receive`: a claim hides the message
//! for the visibility timeout and stamps a receipt handle. Only `delete` with
//! the current handle removes it; otherwise it becomes visible again and is
//! redelivered.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("receipt for message `{0}` is no longer current")]
    StaleReceipt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Proof of a claim, required to acknowledge a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// How many times this message has been claimed, this claim included.
    pub receive_count: i64,
    pub receipt: Receipt,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue `body`, returning the new message id.
    async fn send(&self, body: String) -> Result<String, QueueError>;

    /// Claim up to `max` visible messages, waiting at most `wait` for the
    /// first one to show up.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError>;
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: String,
    body: String,
    enqueued_at_ms: i64,
    receive_count: i64,
    receipt_handle: String,
}

/// SQLite-backed queue living next to the transfer table.
#[derive(Clone)]
pub struct SqliteQueue {
    db: SqlitePool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    arrivals: Arc<Notify>,
}

impl SqliteQueue {
    pub fn new(db: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
            poll_interval: Duration::from_secs(1),
            arrivals: Arc::new(Notify::new()),
        }
    }

    /// Messages currently stored, claimed or not.
    pub async fn depth(&self) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM notification_queue")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    async fn claim(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let hidden_until = now_ms + self.visibility_timeout.as_millis() as i64;
        let handle = Uuid::new_v4().to_string();

        let mut rows = sqlx::query_as::<_, ClaimedRow>(
            "UPDATE notification_queue
             SET visible_at_ms = ?, receive_count = receive_count + 1, receipt_handle = ?
             WHERE id IN (
                 SELECT id FROM notification_queue
                 WHERE visible_at_ms <= ?
                 ORDER BY enqueued_at_ms ASC, id ASC
                 LIMIT ?
             )
             RETURNING id, body, enqueued_at_ms, receive_count, receipt_handle",
        )
        .bind(hidden_until)
        .bind(&handle)
        .bind(now_ms)
        .bind(max as i64)
        .fetch_all(&self.db)
        .await?;
        rows.sort_by_key(|row| row.enqueued_at_ms);

        Ok(rows
            .into_iter()
            .map(|row| ReceivedMessage {
                receipt: Receipt {
                    message_id: row.id.clone(),
                    handle: row.receipt_handle,
                },
                message_id: row.id,
                body: row.body,
                receive_count: row.receive_count,
            })
            .collect())
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn send(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO notification_queue (id, body, enqueued_at_ms, visible_at_ms)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(body)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.db)
        .await?;
        self.arrivals.notify_one();
        Ok(id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max = max.clamp(1, 10);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.claim(max).await?;
            let now = tokio::time::Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            // Woken early by a send; the poll interval catches messages whose
            // visibility timeout lapsed.
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.arrivals.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let result =
            sqlx::query("DELETE FROM notification_queue WHERE id = ? AND receipt_handle = ?")
                .bind(&receipt.message_id)
                .bind(&receipt.handle)
                .execute(&self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::StaleReceipt(receipt.message_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_pool;

    #[tokio::test]
    async fn test_claimed_message_is_hidden_until_deleted() {
        let queue = SqliteQueue::new(test_pool().await, Duration::from_secs(60));
        let id = queue.send("hello".into()).await.unwrap();

        let batch = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].receive_count, 1);

        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        queue.delete(&batch[0].receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_message_is_redelivered() {
        let queue = SqliteQueue::new(test_pool().await, Duration::ZERO);
        queue.send("again".into()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        let second = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);

        // The first claim's handle was superseded.
        assert!(matches!(
            queue.delete(&first[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        queue.delete(&second[0].receipt).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_returns_in_arrival_order() {
        let queue = SqliteQueue::new(test_pool().await, Duration::from_secs(60));
        for body in ["a", "b", "c"] {
            queue.send(body.into()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let bodies: Vec<String> = queue
            .receive(2, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let queue = SqliteQueue::new(test_pool().await, Duration::from_secs(60));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.send("late".into()).await.unwrap();
        });

        let started = std::time::Instant::now();
        let batch = queue.receive(10, Duration::from_secs(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

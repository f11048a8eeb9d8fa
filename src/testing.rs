//! Test doubles and fixtures shared by the unit tests.

use crate::db;
use crate::models::notification::ShareEvent;
use crate::models::transfer::{Transfer, TransferStatus};
use crate::services::mailer::{EmailSender, MailError, OutgoingEmail};
use crate::services::notifier::{NotificationPublisher, NotifyError};
use crate::services::object_gateway::{GatewayError, ObjectGateway, ObjectHead, PresignedUrl};
use crate::services::queue::QueueError;
use crate::services::transfer_store::TransferStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub async fn test_pool() -> SqlitePool {
    let pool = db::connect_in_memory().await.unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

/// Insert a transfer in an arbitrary state, bypassing the lifecycle.
pub async fn seed_transfer(
    store: &TransferStore,
    status: TransferStatus,
    object_key: Option<&str>,
    max_downloads: i64,
    download_count: i64,
    expires_at: Option<DateTime<Utc>>,
) -> Uuid {
    let now = Utc::now();
    let mut transfer = Transfer::pending(now + TimeDelta::hours(1), max_downloads, now);
    transfer.status = status;
    transfer.object_key = object_key.map(str::to_string);
    transfer.download_count = download_count;
    transfer.expires_at = expires_at;
    if status == TransferStatus::Ready {
        transfer.filename = object_key.map(|k| k.rsplit('/').next().unwrap_or(k).to_string());
        transfer.file_size = Some(1);
    }
    // Anything past INIT with a key went through a completed upload.
    if status != TransferStatus::Init && object_key.is_some() {
        transfer.uploaded_at = Some(now);
    }
    store.insert(&transfer).await.unwrap();
    transfer.id
}

#[derive(Default)]
struct GatewayState {
    objects: HashMap<String, ObjectHead>,
    fail_deletes: bool,
    fail_presign: bool,
    head_delay: Duration,
    delete_delay: Duration,
    last_put_content_type: Option<String>,
}

/// In-memory object store with switchable failures.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<GatewayState>,
}

impl MemoryGateway {
    pub fn put_object(&self, key: &str, size: i64, content_type: &str) {
        self.state.lock().unwrap().objects.insert(
            key.to_string(),
            ObjectHead {
                size,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn fail_presign(&self, fail: bool) {
        self.state.lock().unwrap().fail_presign = fail;
    }

    pub fn set_head_delay(&self, delay: Duration) {
        self.state.lock().unwrap().head_delay = delay;
    }

    /// Hold every delete for `delay` before the object is removed.
    pub fn set_delete_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delete_delay = delay;
    }

    pub fn has_object(&self, key: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    pub fn last_put_content_type(&self) -> Option<String> {
        self.state.lock().unwrap().last_put_content_type.clone()
    }

    fn presigned(&self, op: &str, key: &str, ttl: Duration) -> Result<PresignedUrl, GatewayError> {
        if self.state.lock().unwrap().fail_presign {
            return Err(GatewayError::Unavailable("presign disabled".into()));
        }
        Ok(PresignedUrl {
            url: format!("memory://{}/{}", op, key),
            expires_at: Utc::now() + TimeDelta::from_std(ttl).unwrap(),
        })
    }
}

#[async_trait]
impl ObjectGateway for MemoryGateway {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, GatewayError> {
        let url = self.presigned("put", key, ttl)?;
        self.state.lock().unwrap().last_put_content_type = Some(content_type.to_string());
        Ok(url)
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, GatewayError> {
        self.presigned("get", key, ttl)
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, GatewayError> {
        let delay = self.state.lock().unwrap().head_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let delay = self.state.lock().unwrap().delete_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(GatewayError::Unavailable("delete disabled".into()));
        }
        state.objects.remove(key);
        Ok(())
    }
}

/// Mailer that fails for chosen recipients and records every attempt.
#[derive(Default)]
pub struct ScriptedMailer {
    failing: HashSet<String>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

impl ScriptedMailer {
    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            failing: recipients.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for ScriptedMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        self.attempts.lock().unwrap().push(email.to.clone());
        if self.failing.contains(&email.to) {
            return Err(MailError::Rejected(format!("refused {}", email.to)));
        }
        self.delivered.lock().unwrap().push(email.to.clone());
        Ok(())
    }
}

/// Publisher that keeps events in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ShareEvent>>,
    fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<ShareEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn publish(&self, event: &ShareEvent) -> Result<String, NotifyError> {
        if *self.fail.lock().unwrap() {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut).into());
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(Uuid::new_v4().to_string())
    }
}

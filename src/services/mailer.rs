//! Outbound email.
//!
//! `SpoolMailer` drops each message as a text file into a spool directory for
//! an external relay to pick up.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError>;
}

pub struct SpoolMailer {
    dir: PathBuf,
}

impl SpoolMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn render(email: &OutgoingEmail, message_id: &str) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMessage-ID: <{}@transfer-hub>\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\r\n{}",
            email.from,
            email.to,
            email.subject,
            Utc::now().to_rfc2822(),
            message_id,
            email.body
        )
    }
}

fn check_header(name: &str, value: &str) -> Result<(), MailError> {
    if value.trim().is_empty() {
        return Err(MailError::Rejected(format!("empty {} header", name)));
    }
    if value.contains(['\r', '\n']) {
        return Err(MailError::Rejected(format!("line break in {} header", name)));
    }
    Ok(())
}

#[async_trait]
impl EmailSender for SpoolMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        check_header("From", &email.from)?;
        check_header("To", &email.to)?;
        check_header("Subject", &email.subject)?;

        fs::create_dir_all(&self.dir).await?;
        let message_id = Uuid::new_v4().to_string();
        let tmp_path = self.dir.join(format!(".tmp-{}", message_id));
        let final_path = self.dir.join(format!("{}.eml", message_id));

        fs::write(&tmp_path, Self::render(email, &message_id)).await?;
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        info!(to = %email.to, path = %final_path.display(), "email spooled");
        Ok(())
    }
}

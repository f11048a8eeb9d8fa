//! Share events and the bus envelope they travel in.

use super::transfer::Transfer;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The only event type the notification worker acts on.
pub const TRANSFER_SHARED: &str = "TRANSFER_SHARED";

/// Envelope type stamped by the publisher.
pub const ENVELOPE_NOTIFICATION: &str = "Notification";

pub const SHARE_SUBJECT: &str = "File ready for download";

/// Payload published when a download link is shared with recipients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShareEvent {
    pub event_type: String,
    pub transfer_id: String,
    #[serde(default)]
    pub emails: Vec<String>,
    pub download_url: String,
    /// RFC 3339 expiry of `download_url`.
    pub expires_at: String,
    pub filename: String,
    #[serde(default)]
    pub file_size: i64,
}

impl ShareEvent {
    pub fn transfer_shared(
        transfer: &Transfer,
        emails: Vec<String>,
        download_url: String,
        url_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: TRANSFER_SHARED.to_string(),
            transfer_id: transfer.id.to_string(),
            emails,
            download_url,
            expires_at: url_expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            filename: transfer
                .filename
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            file_size: transfer.file_size.unwrap_or(0),
        }
    }

    pub fn email_body(&self) -> String {
        format!(
            "A file has been shared with you.\n\n\
             File: {}\n\
             Size: {} bytes\n\n\
             Download link:\n{}\n\n\
             Note: This link will expire at {}.\n",
            self.filename, self.file_size, self.download_url, self.expires_at
        )
    }
}

/// Wrapper added by the message bus between publisher and queue.
///
/// `message` carries the event as a JSON string, so consumers unwrap one level
/// before parsing the event itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "Type", alias = "type")]
    pub kind: String,
    #[serde(rename = "MessageId", alias = "message_id")]
    pub message_id: String,
    #[serde(rename = "Message", alias = "message")]
    pub message: String,
}

impl Envelope {
    pub fn notification(message_id: String, message: String) -> Self {
        Self {
            kind: ENVELOPE_NOTIFICATION.to_string(),
            message_id,
            message,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifier handed out by the store. Never reused within one store.
pub type MessageId = u64;

/// Addressing declared through `MAIL FROM` / `RCPT TO`, kept for bookkeeping only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
}

/// A parsed message that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub plain_body: String,
    pub html_body: Option<String>,
    pub envelope: Envelope,
    pub size: usize,
}

impl NewMessage {
    /// Stamps the message with its store identity.
    pub fn into_message(self, id: MessageId, received_at: DateTime<Utc>) -> Message {
        Message {
            id,
            from: self.from,
            to: self.to,
            subject: self.subject,
            date: self.date,
            received_at,
            plain_body: self.plain_body,
            has_html: self.html_body.is_some(),
            html_body: self.html_body,
            envelope: self.envelope,
            size: self.size,
        }
    }
}

/// One captured email as exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub received_at: DateTime<Utc>,
    pub plain_body: String,
    pub has_html: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    pub envelope: Envelope,
    pub size: usize,
}

/// Shared types for the sync layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A thread is not a stored entity; it is the grouping of all messages
/// between two parties for one lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub lead_id: i64,
    pub counterparty_id: i64,
}

impl ThreadKey {
    pub fn new(lead_id: i64, counterparty_id: i64) -> Self {
        Self {
            lead_id,
            counterparty_id,
        }
    }
}

/// A server-confirmed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id; unique, NOT guaranteed monotonic per thread
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    /// Correlation tag echoed back from the send request, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<Uuid>,
}

/// Local delivery state of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Present in a server response
    Confirmed,
    /// Sent optimistically, no server confirmation yet
    Pending,
    /// The send request failed; kept visible for manual retry
    Failed,
}

/// One rendered unit of a thread timeline: a message plus its local
/// delivery state. Pending/Failed entries have no server id yet and always
/// carry a client tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Option<i64>,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub client_tag: Option<Uuid>,
    pub delivery: Delivery,
}

impl TimelineEntry {
    /// Wrap a server message as a confirmed entry
    pub fn confirmed(msg: Message) -> Self {
        Self {
            id: Some(msg.id),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            body: msg.body,
            created_at: msg.created_at,
            read: msg.read,
            client_tag: msg.client_tag,
            delivery: Delivery::Confirmed,
        }
    }

    /// Synthesize an optimistic entry for a send in flight
    pub fn pending(sender_id: i64, receiver_id: i64, body: String) -> Self {
        Self {
            id: None,
            sender_id,
            receiver_id,
            body,
            created_at: Utc::now(),
            read: false,
            client_tag: Some(Uuid::new_v4()),
            delivery: Delivery::Pending,
        }
    }
}

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub lead_id: i64,
    /// The other party's user id
    pub counterparty_id: i64,
    /// Preview text of the last message
    pub last_preview: String,
    /// Timestamp of the last message
    pub last_timestamp: DateTime<Utc>,
    /// Messages unread by the current user
    pub unread_count: u32,
}

impl ThreadSummary {
    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.lead_id, self.counterparty_id)
    }
}

/// Presentation weight of a notification; drives cue selection, not
/// delivery semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A platform notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub title: String,
    pub message: String,
    /// Server-side category, e.g. "message", "lead", "billing"
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// For "message" notifications, the thread the message belongs to
    /// (carried in metadata as lead_id/counterparty_id)
    pub fn thread_key(&self) -> Option<ThreadKey> {
        let meta = self.metadata.as_ref()?;
        let lead_id = meta.get("lead_id")?.as_i64()?;
        let counterparty_id = meta.get("counterparty_id")?.as_i64()?;
        Some(ThreadKey::new(lead_id, counterparty_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_shape() {
        let json = serde_json::json!({
            "id": 9,
            "title": "New message",
            "message": "Acme Co replied to your lead",
            "type": "message",
            "severity": "critical",
            "metadata": { "lead_id": 7, "counterparty_id": 42 },
            "read": false,
            "created_at": "2025-11-03T10:15:30Z"
        });

        let n: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(n.kind, "message");
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.thread_key(), Some(ThreadKey::new(7, 42)));
    }

    #[test]
    fn test_thread_key_absent_without_metadata() {
        let json = serde_json::json!({
            "id": 3,
            "title": "Invoice due",
            "message": "Your subscription renews tomorrow",
            "type": "billing",
            "severity": "info",
            "read": true,
            "created_at": "2025-11-03T10:15:30Z"
        });

        let n: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(n.thread_key(), None);
        assert!(n.link.is_none());
    }
}

use crate::messages::DeliveryStatus;
use serde::{Deserialize, Serialize};

/// A local account row. The password hash is a salted PBKDF2 digest (see
/// `auth::credentials`), never the secret itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
    pub server: Option<String>,
    pub created_at: i64,
}

/// A known peer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: i64,
    pub user_id: i64,
    pub peer: String,
    pub added_at: i64,
}

/// One row of conversation history (either direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub user_id: i64,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub timestamp: f64,
    pub created_at: i64,
}

/// Durable state of an outbox entry. `Pending` entries are in the active
/// retry path; `Failed` entries are terminal but retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// The crash-recovery shadow of a not-yet-confirmed outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: i64,
    pub user_id: i64,
    pub recipient: String,
    pub body: String,
    /// Protocol timestamp assigned when the message was first queued.
    pub timestamp: f64,
    pub attempts: u32,
    pub status: OutboxStatus,
    pub created_at: i64,
}

impl OutboxEntry {
    /// The entry's position in the message lifecycle as shown upstream.
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self.status {
            OutboxStatus::Pending => DeliveryStatus::Pending,
            OutboxStatus::Failed => DeliveryStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_status_round_trip() {
        for status in [OutboxStatus::Pending, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::from_str("sent"), None);
    }

    #[test]
    fn test_delivery_status_mapping() {
        let entry = OutboxEntry {
            outbox_id: 1,
            user_id: 1,
            recipient: "bob".to_string(),
            body: "hi".to_string(),
            timestamp: 1.0,
            attempts: 0,
            status: OutboxStatus::Pending,
            created_at: 0,
        };
        assert_eq!(entry.delivery_status(), DeliveryStatus::Pending);
    }
}

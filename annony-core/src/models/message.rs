use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::ConnectionId;

/// Sender label of messages the service writes itself.
pub const SYSTEM_SENDER: &str = "System";

/// A chat message. Immutable once created; `id` is filled in by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub sender: String,
    /// Display time, `HH:MM:SS` UTC
    pub time: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from a connection; `text` must already be validated.
    pub fn from_connection(connection_id: &ConnectionId, text: impl Into<String>) -> Self {
        Self::with_sender(connection_id.sender_label(), text, Utc::now())
    }

    pub fn with_sender(
        sender: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            text: text.into(),
            sender: sender.into(),
            time: display_time(created_at),
            created_at,
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Format the time-of-day shown next to a message.
#[must_use]
pub fn display_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_connection_sets_label_and_time() {
        let id = ConnectionId::from_string("abcd1234abcd1234".to_string());
        let msg = Message::from_connection(&id, "hello");

        assert_eq!(msg.sender, "Anon-abcd");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.time, display_time(msg.created_at));
        assert!(!msg.is_persisted());
    }

    #[test]
    fn test_record_json_shape() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 3, 7).unwrap();
        let mut msg = Message::with_sender("Anon-a1b2", "hi", at);
        msg.id = Some("V1StGXR8_Z5j".to_string());

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "V1StGXR8_Z5j");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["sender"], "Anon-a1b2");
        assert_eq!(json["time"], "09:03:07");
        assert_eq!(json["createdAt"], "2024-05-01T09:03:07Z");
    }

    #[test]
    fn test_unpersisted_message_omits_id() {
        let msg = Message::with_sender(SYSTEM_SENDER, "Welcome", Utc::now());
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("id").is_none());
    }
}

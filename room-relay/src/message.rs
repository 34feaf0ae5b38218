use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// What a [`RoomMessage`] describes. Receivers dispatch on this, never on which
/// fields happen to be populated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Chat,
    Join,
    Leave,
    Presence,
}

/// One event flowing through the hub.
///
/// `sender` is empty for presence, `content` is empty for everything but chat
/// and `users` is only populated for presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(rename = "sendAt", default)]
    pub sent_at: i64,
}

impl RoomMessage {
    pub fn chat(
        room: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Chat,
            room: room.into(),
            sender: sender.into(),
            content: content.into(),
            users: Vec::new(),
            sent_at: now_millis(),
        }
    }

    pub fn join(room: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::event(MessageKind::Join, room.into(), sender.into())
    }

    pub fn leave(room: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::event(MessageKind::Leave, room.into(), sender.into())
    }

    pub fn presence(room: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Presence,
            room: room.into(),
            sender: String::new(),
            content: String::new(),
            users,
            sent_at: now_millis(),
        }
    }

    fn event(kind: MessageKind, room: String, sender: String) -> Self {
        Self {
            kind,
            room,
            sender,
            content: String::new(),
            users: Vec::new(),
            sent_at: now_millis(),
        }
    }
}

/// Payload a client sends in the JSON wire variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    pub content: String,
}

/// Milliseconds since the unix epoch, or 0 if the clock is before it.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Join,
    Leave,
}

impl MessageType {
    pub const ALL: [MessageType; 3] = [MessageType::Text, MessageType::Join, MessageType::Leave];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a chat message bound for a single room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_id: String,
    pub username: String,
    pub message: String,
    /// RFC 3339 creation instant
    pub timestamp: String,
    pub message_type: MessageType,
    pub room_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Echo returned by the chat server for every message it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResponse {
    pub status: ResponseStatus,
    pub server_timestamp: String,
    pub message: String,
}

impl ServerResponse {
    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

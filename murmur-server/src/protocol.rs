//! Wire types for the WebSocket protocol.
//!
//! Frames are JSON objects tagged by an `event` field, e.g.
//! `{"event":"sendMessage","text":"hi","recipientId":"u2"}`.
//! Field names are camelCase on the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated end-user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Process-unique id of one live network session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A persisted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// ULID assigned by the store at insert time.
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub recipient_id: String,
    pub recipient_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One entry of the online-set snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub identity: Identity,
    pub handle: ConnectionHandle,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Explicit join declaration; `id` must match the authenticated identity.
    Join {
        id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    SendMessage {
        text: String,
        recipient_id: String,
    },
    Typing {},
    StopTyping {},
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MessageHistory { messages: Vec<Message> },
    Message { message: Message },
    OnlineUsers { users: Vec<OnlineUser> },
    UserTyping { identity: Identity },
    UserStoppedTyping { identity: Identity },
    Error { kind: String },
}

impl ServerEvent {
    pub fn error(kind: &str) -> Self {
        Self::Error {
            kind: kind.to_string(),
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageHistory { .. } => "messageHistory",
            Self::Message { .. } => "message",
            Self::OnlineUsers { .. } => "onlineUsers",
            Self::UserTyping { .. } => "userTyping",
            Self::UserStoppedTyping { .. } => "userStoppedTyping",
            Self::Error { .. } => "error",
        }
    }
}

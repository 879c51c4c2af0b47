//! Relay message schema and server-generated notices.

use std::fmt;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

use crate::error::RelayError;

// ---------------------------------------------------------------------------
// Message type tag
// ---------------------------------------------------------------------------

/// The `type` tag of a client message.
///
/// Only ping, typing and read receipts change how a message is handled.
/// Every other tag, including ones the hub has never heard of, is a regular
/// message and is relayed and persisted with the tag exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Message,
    Text,
    File,
    Ping,
    Typing,
    ReadReceipt,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Text => "text",
            Self::File => "file",
            Self::Ping => "ping",
            Self::Typing => "typing",
            Self::ReadReceipt => "read_receipt",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "message" => Self::Message,
            "text" => Self::Text,
            "file" => Self::File,
            "ping" => Self::Ping,
            "typing" => Self::Typing,
            "read_receipt" => Self::ReadReceipt,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// A blank or null tag counts as no tag at all.
fn optional_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MessageType>, D::Error> {
    let tag = Option::<String>::deserialize(deserializer)?;
    Ok(tag.filter(|t| !t.trim().is_empty()).map(MessageType::from))
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message exchanged between clients, in both directions.
///
/// Treated as an immutable value once it has been handed to the router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Client-generated idempotency token. Echoed in status notices, never
    /// used for deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Absent means a regular message; the tag is then omitted on the way out.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "optional_tag",
        skip_serializing_if = "Option::is_none"
    )]
    #[schema(value_type = Option<String>, example = "message")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<String>,
    /// Read cutoff for timestamp-based read receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// JSON keys accepted by the strict HTTP ingress.
pub const MESSAGE_FIELDS: &[&str] = &[
    "id",
    "conversationId",
    "senderId",
    "receiverId",
    "content",
    "senderRole",
    "imgUrl",
    "fileName",
    "fileKey",
    "fileType",
    "createdAt",
    "updatedAt",
    "clientId",
    "type",
    "isTyping",
    "isRead",
    "messageIds",
    "timestamp",
];

fn is_false(v: &bool) -> bool {
    !*v
}

fn present(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.trim().is_empty())
}

impl Message {
    pub fn is(&self, kind: &MessageType) -> bool {
        self.kind.as_ref() == Some(kind)
    }

    pub fn has_receiver(&self) -> bool {
        !self.receiver_id.trim().is_empty()
    }

    pub fn has_conversation(&self) -> bool {
        present(&self.conversation_id)
    }

    /// Check the fields the message's type requires.
    pub fn validate(&self) -> Result<(), RelayError> {
        match self.kind {
            Some(MessageType::Ping) => Ok(()),
            Some(MessageType::Typing) => {
                if self.has_receiver() && self.has_conversation() {
                    Ok(())
                } else {
                    Err(RelayError::Validation(
                        "Receiver ID and Conversation ID are required for typing indicators",
                    ))
                }
            }
            Some(MessageType::ReadReceipt) => {
                if self.has_receiver() && self.has_conversation() {
                    Ok(())
                } else {
                    Err(RelayError::Validation(
                        "Receiver ID and Conversation ID are required for read receipts",
                    ))
                }
            }
            _ => {
                if !self.has_receiver() {
                    Err(RelayError::Validation("Receiver ID is required"))
                } else if !self.has_conversation() {
                    Err(RelayError::Validation("Conversation ID is required"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Fill in server-side timestamps the client left out.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at.get_or_insert(now);
    }

    /// Content shortened for log lines.
    pub fn preview(&self) -> String {
        if self.content.chars().count() > 50 {
            let head: String = self.content.chars().take(47).collect();
            format!("{head}...")
        } else {
            self.content.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Replaced,
    ServerShutdown,
}

/// Frames the hub itself sends to a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerNotice {
    Connection {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Ping {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
        server_time: String,
    },
    Error {
        message: String,
    },
    DeliveryStatus {
        status: &'static str,
        client_id: Option<String>,
        timestamp: String,
    },
    PersistenceStatus {
        status: &'static str,
        client_id: Option<String>,
        timestamp: String,
    },
    PersistenceError {
        original_message_id: Option<String>,
        client_id: Option<String>,
        message: &'static str,
    },
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ServerNotice {
    pub fn connected(client_id: &str) -> Self {
        Self::Connection {
            status: ConnectionStatus::Connected,
            client_id: Some(client_id.to_string()),
        }
    }

    pub fn replaced() -> Self {
        Self::Connection {
            status: ConnectionStatus::Replaced,
            client_id: None,
        }
    }

    pub fn server_shutdown() -> Self {
        Self::Connection {
            status: ConnectionStatus::ServerShutdown,
            client_id: None,
        }
    }

    pub fn ping(now: DateTime<Utc>) -> Self {
        Self::Ping {
            timestamp: now.timestamp_millis(),
            server_time: rfc3339(now),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn delivered(message: &Message, now: DateTime<Utc>) -> Self {
        Self::DeliveryStatus {
            status: "delivered",
            client_id: message.client_id.clone(),
            timestamp: rfc3339(now),
        }
    }

    pub fn saved(message: &Message, now: DateTime<Utc>) -> Self {
        Self::PersistenceStatus {
            status: "saved",
            client_id: message.client_id.clone(),
            timestamp: rfc3339(now),
        }
    }

    pub fn not_saved(message: &Message) -> Self {
        Self::PersistenceError {
            original_message_id: message.id.clone(),
            client_id: message.client_id.clone(),
            message: "Message delivered but not saved",
        }
    }
}

/// Serialize any outbound value into a text-frame payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Utf8Bytes, RelayError> {
    Ok(Utf8Bytes::from(serde_json::to_string(value)?))
}

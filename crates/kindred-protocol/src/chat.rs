//! Chat payloads: persisted history entries and WebSocket frames.
//!
//! History and live frames share one shape,
//! `{"message": ..., "sender_id": ..., "timestamp": ...}`. The REST
//! serializer of the backend names the same fields `text`/`created_at` and
//! reports ownership as `is_me` instead of a sender id; both spellings are
//! accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message of `GET /chat/messages/?match_id={id}` (newest-first array).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(alias = "text")]
    pub message: String,

    #[serde(
        default,
        deserialize_with = "crate::deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<String>,

    #[serde(alias = "created_at")]
    pub timestamp: DateTime<Utc>,

    /// Ownership flag computed server-side, when the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_me: Option<bool>,
}

/// Frame received over the chat WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub message: String,

    #[serde(deserialize_with = "crate::deserialize_id")]
    pub sender_id: String,

    /// Absent when the backend relays a message without persisting metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Frame sent over the chat WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub message: String,
}

impl OutboundFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

//! Ordered, de-duplicated message log of one conversation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use kindred_protocol::chat::{HistoryEntry, InboundFrame};

/// A message as the client presents it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub text: String,
    pub is_mine: bool,
    pub created_at: DateTime<Utc>,
    pub sender_id: Option<String>,
}

impl ChatMessage {
    /// Build from a persisted entry. Entries that only carry the backend's
    /// `is_me` flag are attributed to `current_user` when it is set.
    pub fn from_history(entry: HistoryEntry, current_user: &str) -> Self {
        let is_mine = match &entry.sender_id {
            Some(sender) => sender == current_user,
            None => entry.is_me.unwrap_or(false),
        };
        let sender_id = entry
            .sender_id
            .or_else(|| is_mine.then(|| current_user.to_string()));
        Self {
            text: entry.message,
            is_mine,
            created_at: entry.timestamp,
            sender_id,
        }
    }

    /// Build from a live frame. Frames without a timestamp are stamped with
    /// `received_at`.
    pub fn from_frame(frame: InboundFrame, current_user: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            is_mine: frame.sender_id == current_user,
            text: frame.message,
            created_at: frame.timestamp.unwrap_or(received_at),
            sender_id: Some(frame.sender_id),
        }
    }

    fn key(&self) -> MessageKey {
        (self.text.clone(), self.created_at, self.is_mine)
    }
}

type MessageKey = (String, DateTime<Utc>, bool);

/// Messages of one conversation, sorted by `created_at`.
///
/// Equal timestamps keep arrival order. A message with the same sender,
/// text and timestamp as one already present is ignored. Some history
/// entries carry no sender id; those match any sender with the same text,
/// timestamp and ownership.
#[derive(Debug, Default)]
pub struct MessageLog {
    conversation_id: Option<String>,
    messages: Vec<ChatMessage>,
    seen: HashMap<MessageKey, Vec<Option<String>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and bind the log to `conversation_id`.
    pub fn reset(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = Some(conversation_id.into());
        self.messages.clear();
        self.seen.clear();
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Replace the contents with `history`, keeping the conversation binding.
    pub fn replace_with_history(&mut self, history: impl IntoIterator<Item = ChatMessage>) {
        self.messages.clear();
        self.seen.clear();
        for message in history {
            self.push(message);
        }
    }

    /// Insert `message` at its ordered position. Returns `false` for a
    /// duplicate.
    pub fn push(&mut self, message: ChatMessage) -> bool {
        let senders = self.seen.entry(message.key()).or_default();
        let duplicate = senders.iter().any(|sender| match (sender, &message.sender_id) {
            (Some(seen), Some(sender)) => seen == sender,
            _ => true,
        });
        if duplicate {
            return false;
        }
        senders.push(message.sender_id.clone());
        let index = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(index, message);
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

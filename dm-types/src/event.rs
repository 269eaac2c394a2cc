//! Raw events delivered by the realtime backend.
//!
//! Two kinds of payload arrive from the backend:
//! - row changes on the `messages`, `conversations` and `read_receipts`
//!   tables, filtered to the subscribed conversations
//! - ephemeral broadcasts on `typing:{conversation_id}` channels
//!
//! Row payloads are kept as JSON until routed, so a malformed record only
//! fails the event that carries it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Conversation, ConversationId, EventError, Message, MessageId, ReadReceipt, UserId};

/// Prefix of ephemeral typing channels.
pub const TYPING_CHANNEL_PREFIX: &str = "typing:";

/// Name of the typing broadcast channel for a conversation.
pub fn typing_channel(conversation_id: ConversationId) -> String {
    format!("{}{}", TYPING_CHANNEL_PREFIX, conversation_id)
}

/// Tables carried on the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Message rows.
    Messages,
    /// Conversation metadata rows.
    Conversations,
    /// Read receipt rows.
    ReadReceipts,
}

impl Table {
    /// Backend table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::Conversations => "conversations",
            Table::ReadReceipts => "read_receipts",
        }
    }
}

/// Row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// Row inserted.
    #[serde(alias = "INSERT")]
    Insert,
    /// Row updated.
    #[serde(alias = "UPDATE")]
    Update,
    /// Row deleted.
    #[serde(alias = "DELETE")]
    Delete,
}

impl ChangeOp {
    /// Operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// A row change on one of the subscribed tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source table.
    pub table: Table,
    /// Operation.
    pub op: ChangeOp,
    /// New row (absent on delete).
    #[serde(default)]
    pub record: Option<Value>,
    /// Previous row (present on update/delete when the backend sends it).
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// The conversation this change belongs to.
    ///
    /// Looks at the new row first, then the old row (deletes only carry the
    /// old row). Conversation rows are keyed by their own `id`.
    pub fn conversation_id(&self) -> Result<ConversationId, EventError> {
        let key = match self.table {
            Table::Conversations => "id",
            Table::Messages | Table::ReadReceipts => "conversation_id",
        };
        [self.record.as_ref(), self.old_record.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get(key))
            .ok_or(EventError::MissingField(key))
            .and_then(|v| ConversationId::deserialize(v).map_err(EventError::from))
    }

    /// Decode the new row as a message.
    pub fn message(&self) -> Result<Message, EventError> {
        decode(self.record.as_ref())
    }

    /// Decode the new row as conversation metadata.
    pub fn conversation(&self) -> Result<Conversation, EventError> {
        decode(self.record.as_ref())
    }

    /// Decode the new row as a read receipt.
    pub fn read_receipt(&self) -> Result<ReadReceipt, EventError> {
        decode(self.record.as_ref())
    }

    /// Key of a deleted message: `(conversation_id, id)` from the old row.
    pub fn deleted_message_key(&self) -> Result<(ConversationId, MessageId), EventError> {
        let row = self
            .old_record
            .as_ref()
            .or(self.record.as_ref())
            .ok_or(EventError::MissingField("old_record"))?;
        let id = row.get("id").ok_or(EventError::MissingField("id"))?;
        let id = MessageId::deserialize(id)?;
        Ok((self.conversation_id()?, id))
    }
}

fn decode<T: DeserializeOwned>(row: Option<&Value>) -> Result<T, EventError> {
    let row = row.ok_or(EventError::MissingField("record"))?;
    Ok(T::deserialize(row)?)
}

/// Payload of a typing broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Who is typing.
    pub user_id: UserId,
    /// Start (`true`) or stop (`false`).
    pub is_typing: bool,
    /// Sender's clock when the signal was sent.
    pub timestamp: DateTime<Utc>,
}

/// A typing broadcast received on a `typing:{conversation_id}` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingBroadcast {
    /// Channel the broadcast arrived on.
    pub channel: String,
    /// The signal.
    pub payload: TypingPayload,
}

impl TypingBroadcast {
    /// Conversation encoded in the channel name.
    pub fn conversation_id(&self) -> Result<ConversationId, EventError> {
        self.channel
            .strip_prefix(TYPING_CHANNEL_PREFIX)
            .and_then(ConversationId::parse)
            .ok_or_else(|| EventError::InvalidChannel(self.channel.clone()))
    }
}

/// Any event the backend pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    /// Row change.
    Change(ChangeEvent),
    /// Ephemeral typing signal.
    Typing(TypingBroadcast),
}

impl RawEvent {
    /// Parse an untyped JSON payload.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Conversation the event belongs to.
    pub fn conversation_id(&self) -> Result<ConversationId, EventError> {
        match self {
            RawEvent::Change(change) => change.conversation_id(),
            RawEvent::Typing(typing) => typing.conversation_id(),
        }
    }
}

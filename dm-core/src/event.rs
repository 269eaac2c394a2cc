//! Normalized events emitted to the application.

use dm_types::{Conversation, ConversationId, Message, MessageId, ReadReceipt, UserId};

use crate::RealtimeError;

/// Events on the output stream.
///
/// Ordering is preserved per conversation; there is no ordering guarantee
/// across conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A message appeared (server insert or reconciled echo of a local send).
    MessageAdded(Message),
    /// A message changed (edit, soft delete, delivery progress).
    MessageUpdated(Message),
    /// A message row was removed.
    MessageDeleted {
        /// Conversation of the message.
        conversation_id: ConversationId,
        /// The removed message.
        message_id: MessageId,
    },
    /// A participant read up to a message.
    ReadReceipt(ReadReceipt),
    /// Conversation metadata changed.
    ConversationUpdated(Conversation),
    /// A remote participant started or stopped typing.
    Typing {
        /// Conversation.
        conversation_id: ConversationId,
        /// Participant.
        user_id: UserId,
        /// Current state.
        is_typing: bool,
    },
    /// Non-fatal problem worth showing (malformed payload, degraded link).
    Error(RealtimeError),
}

impl SyncEvent {
    /// Conversation the event belongs to, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            SyncEvent::MessageAdded(m) | SyncEvent::MessageUpdated(m) => Some(m.conversation_id),
            SyncEvent::MessageDeleted {
                conversation_id, ..
            } => Some(*conversation_id),
            SyncEvent::ReadReceipt(r) => Some(r.conversation_id),
            SyncEvent::ConversationUpdated(c) => Some(c.id),
            SyncEvent::Typing {
                conversation_id, ..
            } => Some(*conversation_id),
            SyncEvent::Error(_) => None,
        }
    }
}

//! Message and conversation records.
//!
//! Field names follow the backend's row layout (`snake_case`), so records
//! delivered on the change stream deserialize directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidTransition;
use crate::{ConversationId, MessageId, Nonce, UserId};

/// Delivery progress of a message.
///
/// Ordered progression with one branch point:
///
/// ```text
/// sending ──► sent ──► delivered ──► read
///    │
///    └──────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created locally, not yet confirmed by the server.
    Sending,
    /// Stored by the server.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Seen by the recipient.
    Read,
    /// Send failed. Terminal; a retry creates a new message.
    Failed,
}

impl DeliveryStatus {
    /// Whether `self → to` is one of the allowed forward transitions.
    pub fn can_progress(self, to: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, to),
            (Sending, Sent) | (Sending, Failed) | (Sent, Delivered) | (Delivered, Read)
        )
    }

    /// Attempt a transition.
    pub fn transition(self, to: DeliveryStatus) -> Result<DeliveryStatus, InvalidTransition> {
        if self.can_progress(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// `read` and `failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Voice note or audio file.
    Audio,
    /// Any other file.
    File,
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Where the media lives.
    pub url: String,
    /// Kind of media.
    pub kind: AttachmentKind,
    /// MIME type, if known.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size in bytes, if known.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Marker for server-generated system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    /// A participant joined the conversation.
    ParticipantJoined,
    /// A participant left the conversation.
    ParticipantLeft,
    /// The conversation was renamed.
    ConversationRenamed,
    /// A kind this client does not know about.
    #[serde(other)]
    Unknown,
}

/// A direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id (local for optimistic messages, server-assigned otherwise).
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Text content.
    pub content: String,
    /// Attached media.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Delivery progress.
    pub delivery_status: DeliveryStatus,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Reconciliation token; present only on locally originated messages.
    #[serde(default)]
    pub nonce: Option<Nonce>,
    /// Last edit time.
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-delete time.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Expiry time for disappearing messages.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set on server-generated system messages.
    #[serde(default)]
    pub system_kind: Option<SystemKind>,
}

impl Message {
    /// The time of the latest content change: `edited_at`, else `timestamp`.
    pub fn edit_marker(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.timestamp)
    }

    /// Whether the message originated locally.
    pub fn is_local(&self) -> bool {
        self.nonce.is_some()
    }

    /// Whether the message has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether a disappearing message has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Conversation metadata as carried on the conversations change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Display title (group conversations).
    #[serde(default)]
    pub title: Option<String>,
    /// Time of the newest message.
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    /// Preview text of the newest message.
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Unread messages for the current user.
    #[serde(default)]
    pub unread_count: u32,
    /// Last metadata change.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether two snapshots differ only in their unread count.
    pub fn differs_only_in_unread(&self, other: &Conversation) -> bool {
        self.unread_count != other.unread_count
            && Conversation {
                unread_count: other.unread_count,
                updated_at: other.updated_at,
                ..self.clone()
            } == *other
    }
}

/// A reader's acknowledgement that a message was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Conversation of the message.
    pub conversation_id: ConversationId,
    /// Newest message read.
    pub message_id: MessageId,
    /// Reader.
    pub user_id: UserId,
    /// When it was read.
    pub read_at: DateTime<Utc>,
}

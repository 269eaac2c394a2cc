//! Optimistic messages and server reconciliation.
//!
//! A local send goes through three steps:
//! 1. [`ReconciliationEngine::create_optimistic`] builds a `sending` message
//!    carrying a fresh [`Nonce`], shown immediately.
//! 2. The server echo (from the send response or the change stream) is
//!    merged with [`reconcile`], which keeps the nonce so the UI can find
//!    and replace the placeholder.
//! 3. [`deduplicate`] collapses any placeholder/echo pairs that both made
//!    it into a list.
//!
//! The server is authoritative for ids, timestamps and delivery status.
//! Offline edits win on content only when they are newer.

use chrono::{DateTime, Utc};
use dm_types::{Attachment, ConversationId, DeliveryStatus, Message, MessageId, Nonce, UserId};
use std::collections::HashMap;
use std::time::Duration;

use crate::RealtimeError;

/// Builds optimistic messages on behalf of the local user.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    local_user: UserId,
}

impl ReconciliationEngine {
    /// Create an engine for the signed-in user.
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    /// The user optimistic messages are attributed to.
    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Create a `sending` placeholder for a message about to hit the network.
    pub fn create_optimistic(
        &self,
        conversation_id: ConversationId,
        text: impl Into<String>,
        nonce: Nonce,
        attachments: Vec<Attachment>,
    ) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id,
            sender_id: self.local_user,
            content: text.into(),
            attachments,
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::Sending,
            reply_to: None,
            nonce: Some(nonce),
            edited_at: None,
            deleted_at: None,
            expires_at: None,
            system_kind: None,
        }
    }

    /// Build a fresh attempt for a `failed` message.
    ///
    /// The retry is a new message with a new nonce; the failed one stays
    /// terminal. Returns `None` for messages that have not failed.
    pub fn retry(&self, failed: &Message) -> Option<Message> {
        if failed.delivery_status != DeliveryStatus::Failed {
            return None;
        }
        let mut message = self.create_optimistic(
            failed.conversation_id,
            failed.content.clone(),
            Nonce::new(),
            failed.attachments.clone(),
        );
        message.reply_to = failed.reply_to;
        Some(message)
    }
}

/// Merge a server message into its optimistic placeholder.
///
/// Every field comes from `server` except the nonce, which is carried over
/// from `optimistic`.
pub fn reconcile(optimistic: &Message, server: &Message) -> Message {
    Message {
        nonce: optimistic.nonce,
        ..server.clone()
    }
}

/// Find the message with `nonce` in `conversation_id`.
pub fn find_by_nonce<'a>(
    messages: &'a [Message],
    nonce: Nonce,
    conversation_id: ConversationId,
) -> Option<&'a Message> {
    messages
        .iter()
        .find(|m| m.nonce == Some(nonce) && m.conversation_id == conversation_id)
}

/// Keep at most one message per nonce.
///
/// A server-confirmed (non-`sending`) version wins over the placeholder;
/// if only placeholders exist the first one is kept. Messages without a
/// nonce pass through untouched. Relative order is preserved.
pub fn deduplicate(messages: Vec<Message>) -> Vec<Message> {
    let mut keep: HashMap<Nonce, usize> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        let Some(nonce) = message.nonce else {
            continue;
        };
        keep.entry(nonce)
            .and_modify(|best| {
                if messages[*best].delivery_status == DeliveryStatus::Sending
                    && message.delivery_status != DeliveryStatus::Sending
                {
                    *best = index;
                }
            })
            .or_insert(index);
    }

    messages
        .into_iter()
        .enumerate()
        .filter(|(index, m)| match m.nonce {
            Some(nonce) => keep.get(&nonce) == Some(index),
            None => true,
        })
        .map(|(_, m)| m)
        .collect()
}

/// Resolve a message that changed both locally (offline) and on the server.
///
/// Delivery status, id, timestamps and delete markers come from the server.
/// Content, attachments and `edited_at` come from whichever side has the
/// later `edited_at ?? timestamp`; the server wins ties.
pub fn resolve_conflict(local: &Message, server: &Message) -> Message {
    let mut resolved = server.clone();
    if local.edit_marker() > server.edit_marker() {
        resolved.content = local.content.clone();
        resolved.attachments = local.attachments.clone();
        resolved.edited_at = local.edited_at;
    }
    resolved.nonce = local.nonce.or(server.nonce);
    resolved
}

/// Whether `from → to` is an allowed delivery transition.
pub fn can_progress(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    from.can_progress(to)
}

/// Move `message` to `status`, or report why the change is not allowed.
///
/// On error the message is left untouched.
pub fn try_update_delivery_status(
    message: &mut Message,
    status: DeliveryStatus,
) -> Result<(), RealtimeError> {
    message.delivery_status = message.delivery_status.transition(status)?;
    Ok(())
}

/// Apply a delivery-status change if it is a forward step.
///
/// Disallowed requests return the message unchanged; this is a policy
/// filter, not an error.
pub fn update_delivery_status(mut message: Message, status: DeliveryStatus) -> Message {
    if let Err(rejected) = try_update_delivery_status(&mut message, status) {
        tracing::trace!(message_id = %message.id, error = %rejected, "delivery status change ignored");
    }
    message
}

/// Messages still `sending` after `timeout`, to be presented as retryable.
pub fn stale_sending<'a>(
    messages: &'a [Message],
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|m| m.delivery_status == DeliveryStatus::Sending)
        .filter(|m| {
            now.signed_duration_since(m.timestamp)
                .to_std()
                .is_ok_and(|age| age >= timeout)
        })
        .collect()
}

//! Translation of raw backend events into [`SyncEvent`]s.
//!
//! The router is the filter between the change stream and the application:
//! it drops events for conversations that are not visible, maps row changes
//! to typed events, keeps delivery status from moving backwards, hides
//! unread-count churn for the thread the user is reading, and throttles
//! bursts of updates per conversation.
//!
//! Typing broadcasts are not turned into events here; they are handed back
//! as a [`TypingSignal`] for the typing coordinator to judge.

use chrono::{DateTime, Utc};
use dm_types::{
    ChangeEvent, ChangeOp, Conversation, ConversationId, DeliveryStatus, EventError, Message,
    MessageId, RawEvent, Table, UserId,
};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::throttle::ConversationThrottle;
use crate::{RealtimeConfig, RealtimeError, SyncEvent};

/// A typing broadcast addressed to a visible conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    /// Conversation.
    pub conversation_id: ConversationId,
    /// Who sent it.
    pub user_id: UserId,
    /// Start or stop.
    pub is_typing: bool,
    /// Sender's timestamp.
    pub sent_at: DateTime<Utc>,
}

/// Result of routing one raw event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routed {
    /// Events to emit now, in order.
    pub events: Vec<SyncEvent>,
    /// Typing signal for the coordinator.
    pub typing: Option<TypingSignal>,
}

impl Routed {
    fn events(events: Vec<SyncEvent>) -> Self {
        Self {
            events,
            typing: None,
        }
    }

    fn error(err: impl Into<RealtimeError>) -> Self {
        Self::events(vec![SyncEvent::Error(err.into())])
    }
}

/// Routes change-stream events for the visible conversations.
#[derive(Debug)]
pub struct EventRouter {
    visible: BTreeSet<ConversationId>,
    active_thread: Option<ConversationId>,
    throttle: ConversationThrottle,
    statuses: HashMap<MessageId, (ConversationId, DeliveryStatus)>,
    snapshots: HashMap<ConversationId, Conversation>,
}

impl EventRouter {
    /// Create a router with nothing visible.
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            visible: BTreeSet::new(),
            active_thread: None,
            throttle: ConversationThrottle::new(config.throttle_window()),
            statuses: HashMap::new(),
            snapshots: HashMap::new(),
        }
    }

    /// Replace the visible set; state for hidden conversations is dropped.
    pub fn set_visible(&mut self, visible: BTreeSet<ConversationId>) {
        self.statuses.retain(|_, (conv, _)| visible.contains(conv));
        self.snapshots.retain(|conv, _| visible.contains(conv));
        self.throttle.retain(|conv| visible.contains(conv));
        self.visible = visible;
    }

    /// Whether events for `conversation_id` are currently routed.
    pub fn is_visible(&self, conversation_id: &ConversationId) -> bool {
        self.visible.contains(conversation_id)
    }

    /// The thread the user is reading, if any.
    pub fn set_active_thread(&mut self, conversation_id: Option<ConversationId>) {
        self.active_thread = conversation_id;
    }

    /// Seed the status ledger with a message emitted outside the stream.
    pub fn record_status(&mut self, message: &Message) {
        self.statuses.insert(
            message.id,
            (message.conversation_id, message.delivery_status),
        );
    }

    /// Decode and route an untyped payload.
    pub fn route_json(&mut self, bytes: &[u8], now: Instant) -> Routed {
        match RawEvent::from_json(bytes) {
            Ok(raw) => self.route(raw, now),
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed payload");
                Routed::error(err)
            }
        }
    }

    /// Route one event.
    pub fn route(&mut self, raw: RawEvent, now: Instant) -> Routed {
        let conversation_id = match raw.conversation_id() {
            Ok(id) => id,
            Err(err) => {
                tracing::debug!(error = %err, "dropping event without conversation");
                return Routed::error(err);
            }
        };
        if !self.visible.contains(&conversation_id) {
            tracing::debug!(%conversation_id, "dropping event for hidden conversation");
            return Routed::default();
        }

        match raw {
            RawEvent::Typing(broadcast) => Routed {
                events: vec![],
                typing: Some(TypingSignal {
                    conversation_id,
                    user_id: broadcast.payload.user_id,
                    is_typing: broadcast.payload.is_typing,
                    sent_at: broadcast.payload.timestamp,
                }),
            },
            RawEvent::Change(change) => match self.translate(conversation_id, &change) {
                Ok(Some(event)) => Routed::events(self.throttle.offer(event, now)),
                Ok(None) => Routed::default(),
                Err(err) => {
                    tracing::debug!(
                        table = change.table.as_str(),
                        op = change.op.as_str(),
                        error = %err,
                        "dropping malformed change"
                    );
                    Routed::error(err)
                }
            },
        }
    }

    /// Emit throttled batches that are due.
    pub fn flush_due(&mut self, now: Instant) -> Vec<SyncEvent> {
        self.throttle.flush_due(now)
    }

    /// When the next throttled batch is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.next_deadline()
    }

    fn translate(
        &mut self,
        conversation_id: ConversationId,
        change: &ChangeEvent,
    ) -> Result<Option<SyncEvent>, EventError> {
        match (change.table, change.op) {
            (Table::Messages, ChangeOp::Insert) => {
                let message = change.message()?;
                self.record_status(&message);
                Ok(Some(SyncEvent::MessageAdded(message)))
            }
            (Table::Messages, ChangeOp::Update) => {
                let mut message = change.message()?;
                message.delivery_status = self.clamp_status(&message);
                self.record_status(&message);
                Ok(Some(SyncEvent::MessageUpdated(message)))
            }
            (Table::Messages, ChangeOp::Delete) => {
                let (conversation_id, message_id) = change.deleted_message_key()?;
                self.statuses.remove(&message_id);
                Ok(Some(SyncEvent::MessageDeleted {
                    conversation_id,
                    message_id,
                }))
            }
            (Table::Conversations, ChangeOp::Insert | ChangeOp::Update) => {
                let conversation = change.conversation()?;
                if self.is_unread_churn(conversation_id, &conversation) {
                    tracing::debug!(%conversation_id, "unread update for active thread suppressed");
                    return Ok(None);
                }
                self.snapshots.insert(conversation_id, conversation.clone());
                Ok(Some(SyncEvent::ConversationUpdated(conversation)))
            }
            (Table::ReadReceipts, ChangeOp::Insert | ChangeOp::Update) => {
                Ok(Some(SyncEvent::ReadReceipt(change.read_receipt()?)))
            }
            (table, op) => Err(EventError::UnsupportedOperation {
                table: table.as_str().to_string(),
                op: op.as_str().to_string(),
            }),
        }
    }

    /// Status to emit for an updated message: the incoming one if it is a
    /// valid forward step, otherwise the last emitted one.
    fn clamp_status(&self, message: &Message) -> DeliveryStatus {
        match self.statuses.get(&message.id) {
            Some(&(_, current)) if current != message.delivery_status => {
                match current.transition(message.delivery_status) {
                    Ok(next) => next,
                    Err(rejected) => {
                        tracing::debug!(message_id = %message.id, %rejected, "status change rejected");
                        current
                    }
                }
            }
            _ => message.delivery_status,
        }
    }

    fn is_unread_churn(&self, conversation_id: ConversationId, next: &Conversation) -> bool {
        self.active_thread == Some(conversation_id)
            && self
                .snapshots
                .get(&conversation_id)
                .is_some_and(|prev| prev.differs_only_in_unread(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn router(visible: &[ConversationId]) -> EventRouter {
        let mut router = EventRouter::new(&RealtimeConfig::default());
        router.set_visible(visible.iter().copied().collect());
        router
    }

    fn message_change(op: &str, conv: ConversationId, id: MessageId, status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "kind": "change",
            "table": "messages",
            "op": op,
            "record": {
                "id": id,
                "conversation_id": conv,
                "sender_id": UserId::new(),
                "content": "hello",
                "timestamp": "2026-03-01T12:00:00Z",
                "delivery_status": status
            }
        }))
        .unwrap()
    }

    fn conversation_change(conv: ConversationId, unread: u32, preview: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "kind": "change",
            "table": "conversations",
            "op": "update",
            "record": {
                "id": conv,
                "last_message_preview": preview,
                "unread_count": unread,
                "updated_at": "2026-03-01T12:00:00Z"
            }
        }))
        .unwrap()
    }

    // ===========================================
    // Translation Tests
    // ===========================================

    #[test]
    fn insert_becomes_message_added() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);

        let routed = router.route_json(
            &message_change("insert", conv, MessageId::new(), "sent"),
            Instant::now(),
        );

        assert!(matches!(routed.events.as_slice(), [SyncEvent::MessageAdded(_)]));
        assert!(routed.typing.is_none());
    }

    #[test]
    fn delete_becomes_message_deleted() {
        let conv = ConversationId::new();
        let id = MessageId::new();
        let mut router = router(&[conv]);
        let bytes = serde_json::to_vec(&json!({
            "kind": "change",
            "table": "messages",
            "op": "delete",
            "old_record": { "id": id, "conversation_id": conv }
        }))
        .unwrap();

        let routed = router.route_json(&bytes, Instant::now());

        assert_eq!(
            routed.events,
            vec![SyncEvent::MessageDeleted {
                conversation_id: conv,
                message_id: id
            }]
        );
    }

    #[test]
    fn read_receipt_routed() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let bytes = serde_json::to_vec(&json!({
            "kind": "change",
            "table": "read_receipts",
            "op": "insert",
            "record": {
                "conversation_id": conv,
                "message_id": MessageId::new(),
                "user_id": UserId::new(),
                "read_at": "2026-03-01T12:00:00Z"
            }
        }))
        .unwrap();

        let routed = router.route_json(&bytes, Instant::now());

        assert!(matches!(routed.events.as_slice(), [SyncEvent::ReadReceipt(_)]));
    }

    #[test]
    fn typing_handed_to_coordinator() {
        let conv = ConversationId::new();
        let user = UserId::new();
        let mut router = router(&[conv]);
        let bytes = serde_json::to_vec(&json!({
            "kind": "typing",
            "channel": dm_types::typing_channel(conv),
            "payload": { "userId": user, "isTyping": true, "timestamp": "2026-03-01T12:00:00Z" }
        }))
        .unwrap();

        let routed = router.route_json(&bytes, Instant::now());

        assert!(routed.events.is_empty());
        let signal = routed.typing.unwrap();
        assert_eq!(signal.user_id, user);
        assert!(signal.is_typing);
    }

    // ===========================================
    // Filtering / Error Tests
    // ===========================================

    #[test]
    fn hidden_conversation_dropped() {
        let mut router = router(&[ConversationId::new()]);

        let routed = router.route_json(
            &message_change("insert", ConversationId::new(), MessageId::new(), "sent"),
            Instant::now(),
        );

        assert_eq!(routed, Routed::default());
    }

    #[test]
    fn malformed_payload_becomes_error_event() {
        let mut router = router(&[]);

        let routed = router.route_json(b"\x00garbage", Instant::now());

        assert!(matches!(
            routed.events.as_slice(),
            [SyncEvent::Error(RealtimeError::MalformedEvent(_))]
        ));
    }

    #[test]
    fn malformed_record_in_visible_conversation() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let bytes = serde_json::to_vec(&json!({
            "kind": "change",
            "table": "messages",
            "op": "insert",
            "record": { "conversation_id": conv, "content": 42 }
        }))
        .unwrap();

        let routed = router.route_json(&bytes, Instant::now());

        assert!(matches!(
            routed.events.as_slice(),
            [SyncEvent::Error(RealtimeError::MalformedEvent(_))]
        ));
    }

    #[test]
    fn conversation_delete_unsupported() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let bytes = serde_json::to_vec(&json!({
            "kind": "change",
            "table": "conversations",
            "op": "delete",
            "old_record": { "id": conv }
        }))
        .unwrap();

        let routed = router.route_json(&bytes, Instant::now());

        match routed.events.as_slice() {
            [SyncEvent::Error(RealtimeError::MalformedEvent(msg))] => {
                assert!(msg.contains("unsupported operation delete on conversations"));
            }
            other => panic!("Expected malformed error, got {:?}", other),
        }
    }

    // ===========================================
    // Delivery Status Tests
    // ===========================================

    #[test]
    fn status_never_regresses() {
        let conv = ConversationId::new();
        let id = MessageId::new();
        let mut router = router(&[conv]);
        let t0 = Instant::now();

        router.route_json(&message_change("insert", conv, id, "delivered"), t0);
        let routed = router.route_json(&message_change("update", conv, id, "sent"), t0);

        match routed.events.as_slice() {
            [SyncEvent::MessageUpdated(m)] => {
                assert_eq!(m.delivery_status, DeliveryStatus::Delivered)
            }
            other => panic!("Expected update, got {:?}", other),
        }
    }

    #[test]
    fn status_progresses_forward() {
        let conv = ConversationId::new();
        let id = MessageId::new();
        let mut router = router(&[conv]);
        let t0 = Instant::now();

        router.route_json(&message_change("insert", conv, id, "sent"), t0);
        let routed = router.route_json(&message_change("update", conv, id, "delivered"), t0);

        assert!(matches!(
            routed.events.as_slice(),
            [SyncEvent::MessageUpdated(m)] if m.delivery_status == DeliveryStatus::Delivered
        ));
    }

    // ===========================================
    // Throttle / Active Thread Tests
    // ===========================================

    #[test]
    fn update_burst_throttled_then_flushed() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let t0 = Instant::now();

        let first = router.route_json(&conversation_change(conv, 1, "a"), t0);
        assert_eq!(first.events.len(), 1);
        for unread in 2..=5 {
            let routed = router.route_json(&conversation_change(conv, unread, "b"), t0);
            assert!(routed.events.is_empty());
        }

        assert_eq!(router.next_deadline(), Some(t0 + Duration::from_millis(300)));
        let flushed = router.flush_due(t0 + Duration::from_millis(300));
        assert!(matches!(
            flushed.as_slice(),
            [SyncEvent::ConversationUpdated(c)] if c.unread_count == 5
        ));
    }

    #[test]
    fn active_thread_unread_churn_suppressed() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        router.set_active_thread(Some(conv));
        let t0 = Instant::now();

        assert_eq!(router.route_json(&conversation_change(conv, 0, "a"), t0).events.len(), 1);

        let later = t0 + Duration::from_secs(1);
        assert!(router
            .route_json(&conversation_change(conv, 3, "a"), later)
            .events
            .is_empty());
        // A real change still comes through
        assert_eq!(
            router
                .route_json(&conversation_change(conv, 3, "new preview"), later)
                .events
                .len(),
            1
        );
    }

    #[test]
    fn inactive_thread_unread_changes_emitted() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let t0 = Instant::now();

        router.route_json(&conversation_change(conv, 0, "a"), t0);
        let routed = router.route_json(
            &conversation_change(conv, 1, "a"),
            t0 + Duration::from_secs(1),
        );

        assert_eq!(routed.events.len(), 1);
    }

    #[test]
    fn hiding_conversation_drops_pending() {
        let conv = ConversationId::new();
        let mut router = router(&[conv]);
        let t0 = Instant::now();
        router.route_json(&conversation_change(conv, 1, "a"), t0);
        router.route_json(&conversation_change(conv, 2, "a"), t0);

        router.set_visible(BTreeSet::new());

        assert!(router.next_deadline().is_none());
        assert!(router.flush_due(t0 + Duration::from_secs(1)).is_empty());
    }
}

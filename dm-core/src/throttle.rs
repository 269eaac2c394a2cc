//! Per-conversation update throttle.
//!
//! Update-class events (message edits and status changes, conversation
//! metadata, read receipts) are emitted on the leading edge and then at most
//! once per window per conversation. Updates arriving inside the window are
//! merged, latest wins per key, and flushed when the window ends; nothing is
//! dropped, only coalesced.
//!
//! Inserts and deletes pass straight through, after flushing whatever is
//! pending for their conversation so per-message order is kept.

use dm_types::{ConversationId, MessageId, UserId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::SyncEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MergeKey {
    Message(MessageId),
    Conversation,
    Receipt(UserId),
}

fn merge_key(event: &SyncEvent) -> Option<MergeKey> {
    match event {
        SyncEvent::MessageUpdated(m) => Some(MergeKey::Message(m.id)),
        SyncEvent::ConversationUpdated(_) => Some(MergeKey::Conversation),
        SyncEvent::ReadReceipt(r) => Some(MergeKey::Receipt(r.user_id)),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Slot {
    last_emit: Option<Instant>,
    pending: Vec<(MergeKey, SyncEvent)>,
}

impl Slot {
    fn window_open(&self, now: Instant, window: Duration) -> bool {
        self.last_emit.map_or(true, |last| now >= last + window)
    }
}

/// Coalesces bursts of updates per conversation.
#[derive(Debug)]
pub struct ConversationThrottle {
    window: Duration,
    slots: HashMap<ConversationId, Slot>,
}

impl ConversationThrottle {
    /// Create a throttle with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: HashMap::new(),
        }
    }

    /// Offer an event; returns the events to emit now, in order.
    pub fn offer(&mut self, event: SyncEvent, now: Instant) -> Vec<SyncEvent> {
        let Some(conversation_id) = event.conversation_id() else {
            return vec![event];
        };
        let window = self.window;
        let slot = self.slots.entry(conversation_id).or_default();

        let Some(key) = merge_key(&event) else {
            let mut out = drain(slot, now);
            out.push(event);
            return out;
        };

        if slot.pending.is_empty() && slot.window_open(now, window) {
            slot.last_emit = Some(now);
            return vec![event];
        }

        match slot.pending.iter_mut().find(|(k, _)| *k == key) {
            Some((_, pending)) => *pending = event,
            None => slot.pending.push((key, event)),
        }
        if slot.window_open(now, window) {
            return drain(slot, now);
        }
        tracing::debug!(%conversation_id, pending = slot.pending.len(), "update throttled");
        vec![]
    }

    /// Emit pending batches whose window has ended.
    pub fn flush_due(&mut self, now: Instant) -> Vec<SyncEvent> {
        let window = self.window;
        let mut out = Vec::new();
        self.slots.retain(|_, slot| {
            if slot.pending.is_empty() {
                return !slot.window_open(now, window);
            }
            if slot.window_open(now, window) {
                out.extend(drain(slot, now));
            }
            true
        });
        out
    }

    /// Drop state for conversations not matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&ConversationId) -> bool) {
        self.slots.retain(|id, _| keep(id));
    }

    /// When the next pending batch is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| !slot.pending.is_empty())
            .filter_map(|slot| slot.last_emit.map(|last| last + self.window))
            .min()
    }
}

fn drain(slot: &mut Slot, now: Instant) -> Vec<SyncEvent> {
    if slot.pending.is_empty() {
        return vec![];
    }
    slot.last_emit = Some(now);
    slot.pending.drain(..).map(|(_, event)| event).collect()
}

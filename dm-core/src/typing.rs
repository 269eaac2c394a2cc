//! Typing indicators.
//!
//! Local typing is broadcast; remote typing is only displayed. The two are
//! tracked separately:
//!
//! - **local** state per conversation drives start/stop/keepalive
//!   broadcasts. A start is re-sent every `keepalive` while typing, and
//!   typing stops on its own if not refreshed within `auto_stop`.
//! - **remote** state per (conversation, user) is passive. It reports a
//!   change only when the visible state flips, expires entries whose last
//!   signal is older than `auto_stop`, and ignores signals that are older
//!   than one already accepted.
//!
//! Stopped entries linger for `grace` so a late duplicate stop (or a start
//! sent before it) cannot resurrect the indicator.

use chrono::{DateTime, Utc};
use dm_types::{ConversationId, UserId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::RealtimeConfig;

/// Output of the typing coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    /// Broadcast the local user's state on the conversation's typing channel.
    Broadcast {
        /// Conversation.
        conversation_id: ConversationId,
        /// Start (`true`) or stop (`false`).
        is_typing: bool,
    },
    /// A remote participant's displayed state changed.
    Changed {
        /// Conversation.
        conversation_id: ConversationId,
        /// Participant.
        user_id: UserId,
        /// New displayed state.
        is_typing: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Local {
    Typing {
        keepalive_at: Instant,
        auto_stop_at: Instant,
    },
    Stopped {
        remove_at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteState {
    Typing { expires_at: Instant },
    Stopped { remove_at: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Remote {
    state: RemoteState,
    last_signal: DateTime<Utc>,
}

/// Typing state for the local user and every visible participant.
#[derive(Debug, Clone)]
pub struct TypingCoordinator {
    keepalive: Duration,
    auto_stop: Duration,
    grace: Duration,
    local: BTreeMap<ConversationId, Local>,
    remote: BTreeMap<(ConversationId, UserId), Remote>,
}

impl TypingCoordinator {
    /// Create a coordinator with no typing state.
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            keepalive: config.typing_keepalive(),
            auto_stop: config.typing_auto_stop(),
            grace: config.typing_state_grace(),
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
        }
    }

    /// The local user started (`true`) or stopped (`false`) typing.
    pub fn set_local(
        &mut self,
        conversation_id: ConversationId,
        is_typing: bool,
        now: Instant,
    ) -> Vec<TypingAction> {
        let current = self.local.get(&conversation_id).copied();
        match (current, is_typing) {
            (Some(Local::Typing { keepalive_at, .. }), true) => {
                self.local.insert(
                    conversation_id,
                    Local::Typing {
                        keepalive_at,
                        auto_stop_at: now + self.auto_stop,
                    },
                );
                vec![]
            }
            (_, true) => {
                self.local.insert(
                    conversation_id,
                    Local::Typing {
                        keepalive_at: now + self.keepalive,
                        auto_stop_at: now + self.auto_stop,
                    },
                );
                vec![broadcast(conversation_id, true)]
            }
            (Some(Local::Typing { .. }), false) => {
                self.stop_local(conversation_id, now);
                vec![broadcast(conversation_id, false)]
            }
            (_, false) => vec![],
        }
    }

    /// Stop every local typing state (app backgrounded or shutting down).
    pub fn stop_all(&mut self, now: Instant) -> Vec<TypingAction> {
        let typing: Vec<ConversationId> = self
            .local
            .iter()
            .filter(|(_, state)| matches!(state, Local::Typing { .. }))
            .map(|(id, _)| *id)
            .collect();
        typing
            .into_iter()
            .map(|id| {
                self.stop_local(id, now);
                broadcast(id, false)
            })
            .collect()
    }

    /// Record a typing signal received from another participant.
    ///
    /// Returns the change to display, if the visible state flipped.
    pub fn observe_remote(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
        sent_at: DateTime<Utc>,
        now: Instant,
    ) -> Option<TypingAction> {
        let key = (conversation_id, user_id);
        let previous = self.remote.get(&key).copied();

        if let Some(prev) = previous {
            if sent_at < prev.last_signal {
                tracing::debug!(%conversation_id, %user_id, "stale typing signal ignored");
                return None;
            }
        }

        let was_typing = matches!(
            previous.map(|p| p.state),
            Some(RemoteState::Typing { .. })
        );
        let state = if is_typing {
            RemoteState::Typing {
                expires_at: now + self.auto_stop,
            }
        } else {
            match previous.map(|p| p.state) {
                Some(stopped @ RemoteState::Stopped { .. }) => stopped,
                _ => RemoteState::Stopped {
                    remove_at: now + self.grace,
                },
            }
        };
        self.remote.insert(
            key,
            Remote {
                state,
                last_signal: sent_at,
            },
        );

        (was_typing != is_typing).then_some(TypingAction::Changed {
            conversation_id,
            user_id,
            is_typing,
        })
    }

    /// Fire every timer that is due.
    pub fn poll(&mut self, now: Instant) -> Vec<TypingAction> {
        let mut actions = Vec::new();

        let keepalive = self.keepalive;
        let grace = self.grace;
        self.local.retain(|id, state| match *state {
            Local::Typing { auto_stop_at, .. } if now >= auto_stop_at => {
                tracing::debug!(conversation_id = %id, "local typing auto-stopped");
                *state = Local::Stopped {
                    remove_at: now + grace,
                };
                actions.push(broadcast(*id, false));
                true
            }
            Local::Typing {
                keepalive_at,
                auto_stop_at,
            } if now >= keepalive_at => {
                *state = Local::Typing {
                    keepalive_at: now + keepalive,
                    auto_stop_at,
                };
                actions.push(broadcast(*id, true));
                true
            }
            Local::Stopped { remove_at } => now < remove_at,
            Local::Typing { .. } => true,
        });

        self.remote.retain(|(conversation_id, user_id), entry| match entry.state {
            RemoteState::Typing { expires_at } if now >= expires_at => {
                entry.state = RemoteState::Stopped {
                    remove_at: now + grace,
                };
                actions.push(TypingAction::Changed {
                    conversation_id: *conversation_id,
                    user_id: *user_id,
                    is_typing: false,
                });
                true
            }
            RemoteState::Stopped { remove_at } => now < remove_at,
            RemoteState::Typing { .. } => true,
        });

        actions
    }

    /// Drop remote state for a conversation that left the visible set.
    pub fn forget_conversation(&mut self, conversation_id: ConversationId) {
        self.remote.retain(|(id, _), _| *id != conversation_id);
    }

    /// Whether a remote participant is shown as typing.
    pub fn is_remote_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        matches!(
            self.remote.get(&(conversation_id, user_id)),
            Some(Remote {
                state: RemoteState::Typing { .. },
                ..
            })
        )
    }

    /// Whether the local user is typing in a conversation.
    pub fn is_local_typing(&self, conversation_id: ConversationId) -> bool {
        matches!(
            self.local.get(&conversation_id),
            Some(Local::Typing { .. })
        )
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let local = self.local.values().map(|state| match *state {
            Local::Typing {
                keepalive_at,
                auto_stop_at,
            } => keepalive_at.min(auto_stop_at),
            Local::Stopped { remove_at } => remove_at,
        });
        let remote = self.remote.values().map(|entry| match entry.state {
            RemoteState::Typing { expires_at } => expires_at,
            RemoteState::Stopped { remove_at } => remove_at,
        });
        local.chain(remote).min()
    }

    fn stop_local(&mut self, conversation_id: ConversationId, now: Instant) {
        self.local.insert(
            conversation_id,
            Local::Stopped {
                remove_at: now + self.grace,
            },
        );
    }
}

fn broadcast(conversation_id: ConversationId, is_typing: bool) -> TypingAction {
    TypingAction::Broadcast {
        conversation_id,
        is_typing,
    }
}

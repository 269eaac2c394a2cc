//! Subscription link state machine.
//!
//! Tracks whether the realtime subscriptions are healthy and decides when to
//! retry. Pure: it takes events and returns the new state plus actions; the
//! observer performs the backend calls and owns the retry timer.
//!
//! ```text
//! Idle ──► Subscribing ──► Live
//!               │            │
//!               ▼            ▼
//!          Reconnecting{n} ◄─┘ ──(n > max_attempts)──► Degraded
//! ```

use std::time::Duration;

use crate::{ReconnectConfig, RealtimeError};

/// Health of the subscription set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Nothing requested yet.
    #[default]
    Idle,
    /// Subscriptions requested, not yet confirmed.
    Subscribing,
    /// Every planned chunk has a live subscription.
    Live,
    /// A subscription failed; a retry is scheduled.
    Reconnecting {
        /// Retry number currently scheduled (1-based).
        attempt: u32,
        /// Most recent failure.
        last_error: RealtimeError,
    },
    /// Retries exhausted; waiting for the app to resume or change visibility.
    Degraded {
        /// Retries made before giving up.
        attempts: u32,
    },
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The visible set was committed and subscriptions are being applied.
    SubscribeRequested,
    /// Every planned chunk is subscribed.
    SubscribeSucceeded,
    /// A subscribe call failed or a live subscription was dropped.
    SubscriptionFailed {
        /// Why the subscription failed.
        error: RealtimeError,
    },
    /// The retry timer fired.
    RetryTimer,
    /// App returned to the foreground; start over with a clean slate.
    Resume,
    /// Observer shutting down.
    Shutdown,
}

/// Work for the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Tear down and re-establish every planned chunk.
    Resubscribe,
    /// Arm the retry timer.
    ScheduleRetry {
        /// Delay before the retry.
        delay: Duration,
    },
    /// Disarm the retry timer.
    CancelRetry,
    /// Emit an error to the application.
    Emit(RealtimeError),
}

impl LinkState {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LinkEvent, reconnect: &ReconnectConfig) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            (_, LinkEvent::Shutdown) => (Self::Idle, vec![LinkAction::CancelRetry]),
            (_, LinkEvent::Resume) => (
                Self::Subscribing,
                vec![LinkAction::CancelRetry, LinkAction::Resubscribe],
            ),

            (state @ Self::Reconnecting { .. }, LinkEvent::SubscribeRequested) => (state, vec![]),
            (_, LinkEvent::SubscribeRequested) => (Self::Subscribing, vec![]),

            (Self::Reconnecting { .. }, LinkEvent::SubscribeSucceeded) => {
                tracing::info!("subscriptions recovered");
                (Self::Live, vec![LinkAction::CancelRetry])
            }
            (_, LinkEvent::SubscribeSucceeded) => (Self::Live, vec![]),

            (Self::Reconnecting { attempt, .. }, LinkEvent::SubscriptionFailed { error }) => {
                if attempt >= reconnect.max_attempts {
                    tracing::warn!(attempts = attempt, error = %error, "giving up on subscriptions");
                    (
                        Self::Degraded { attempts: attempt },
                        vec![
                            LinkAction::CancelRetry,
                            LinkAction::Emit(RealtimeError::ReconnectExhausted {
                                attempts: attempt,
                                last_error: error.to_string(),
                            }),
                        ],
                    )
                } else {
                    let next = attempt.saturating_add(1);
                    retry(next, error, reconnect)
                }
            }
            (state @ Self::Degraded { .. }, LinkEvent::SubscriptionFailed { .. }) => (state, vec![]),
            (_, LinkEvent::SubscriptionFailed { error }) => retry(1, error, reconnect),

            (state @ Self::Reconnecting { .. }, LinkEvent::RetryTimer) => {
                (state, vec![LinkAction::Resubscribe])
            }

            // Anything else leaves the state unchanged
            (state, _) => (state, vec![]),
        }
    }

    /// Whether every planned chunk is subscribed.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Whether retries have been exhausted.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

fn retry(attempt: u32, error: RealtimeError, reconnect: &ReconnectConfig) -> (LinkState, Vec<LinkAction>) {
    let delay = reconnect.backoff(attempt);
    tracing::warn!(attempt, ?delay, error = %error, "subscription failed, retrying");
    (
        LinkState::Reconnecting {
            attempt,
            last_error: error,
        },
        vec![LinkAction::ScheduleRetry { delay }],
    )
}

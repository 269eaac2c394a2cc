//! Error taxonomy of the realtime core.
//!
//! None of these cross the public Input/Output boundary as a failure: they
//! are retried internally, surfaced as a non-fatal [`SyncEvent::Error`], or
//! silently absorbed.
//!
//! [`SyncEvent::Error`]: crate::SyncEvent::Error

use dm_types::{DeliveryStatus, EventError, InvalidTransition};
use thiserror::Error;

/// Errors produced by the realtime core.
///
/// `Clone` so they can travel on the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// Backend rejected or dropped a subscription. Triggers a reconnect.
    #[error("subscription failure: {0}")]
    SubscriptionFailure(String),

    /// Payload could not be decoded. The event is dropped.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Illegal delivery-status change. Expected under races; never surfaced.
    #[error("invalid delivery transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status.
        from: DeliveryStatus,
        /// Requested status.
        to: DeliveryStatus,
    },

    /// Reconnection gave up; connectivity is degraded until the next resume.
    #[error("reconnect attempts exhausted after {attempts} tries: {last_error}")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last failure seen.
        last_error: String,
    },
}

impl From<EventError> for RealtimeError {
    fn from(err: EventError) -> Self {
        RealtimeError::MalformedEvent(err.to_string())
    }
}

impl From<InvalidTransition> for RealtimeError {
    fn from(err: InvalidTransition) -> Self {
        RealtimeError::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

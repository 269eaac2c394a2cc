//! Realtime backend abstraction.
//!
//! The observer never talks to a network directly. It asks a
//! [`RealtimeBackend`] to open filtered change subscriptions and to send
//! typing broadcasts; the backend pushes what it receives back into the
//! observer through [`Observer::deliver`] and reports dropped
//! subscriptions through [`Observer::subscription_lost`].
//!
//! [`Observer::deliver`]: crate::Observer::deliver
//! [`Observer::subscription_lost`]: crate::Observer::subscription_lost

mod mock;

pub use mock::MockBackend;

use async_trait::async_trait;
use dm_core::{ChannelSpec, RealtimeError};
use dm_types::TypingPayload;
use std::fmt;
use thiserror::Error;

/// Opaque id of a live backend subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u64);

impl StreamHandle {
    /// Wrap a backend-assigned id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The backend-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHandle({})", self.0)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend refused the subscription.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The handle is not (or no longer) known to the backend.
    #[error("unknown stream {0}")]
    UnknownStream(StreamHandle),

    /// A broadcast could not be sent.
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
}

impl From<BackendError> for RealtimeError {
    fn from(err: BackendError) -> Self {
        RealtimeError::SubscriptionFailure(err.to_string())
    }
}

/// Realtime backend used by the observer.
///
/// Implementations wrap a concrete realtime service (or a mock).
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Open one filtered change subscription.
    async fn subscribe(&self, spec: &ChannelSpec) -> Result<StreamHandle, BackendError>;

    /// Close a subscription.
    async fn unsubscribe(&self, handle: StreamHandle) -> Result<(), BackendError>;

    /// Send an ephemeral typing signal on `channel`.
    async fn broadcast(&self, channel: &str, payload: &TypingPayload) -> Result<(), BackendError>;
}

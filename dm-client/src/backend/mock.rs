//! Mock backend for testing.
//!
//! Records every call and allows forcing subscribe and broadcast failures.

use super::{BackendError, RealtimeBackend, StreamHandle};
use async_trait::async_trait;
use dm_core::ChannelSpec;
use dm_types::TypingPayload;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock backend for testing.
///
/// Clones share state, so a test can keep one clone while the observer
/// owns another.
#[derive(Debug, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockBackendInner>>,
}

#[derive(Debug, Default)]
struct MockBackendInner {
    next_handle: u64,
    active: BTreeMap<StreamHandle, ChannelSpec>,
    subscribe_calls: usize,
    unsubscribed: Vec<StreamHandle>,
    broadcasts: Vec<(String, TypingPayload)>,
    fail_next_subscribe: Option<String>,
    fail_all_subscribes: Option<String>,
    fail_next_broadcast: Option<String>,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockBackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Specs of the subscriptions currently open, in handle order.
    pub fn active_subscriptions(&self) -> Vec<ChannelSpec> {
        self.inner().active.values().cloned().collect()
    }

    /// Handles currently open.
    pub fn active_handles(&self) -> Vec<StreamHandle> {
        self.inner().active.keys().copied().collect()
    }

    /// Number of `subscribe` calls, successful or not.
    pub fn subscribe_calls(&self) -> usize {
        self.inner().subscribe_calls
    }

    /// Handles passed to `unsubscribe`, in call order.
    pub fn unsubscribed(&self) -> Vec<StreamHandle> {
        self.inner().unsubscribed.clone()
    }

    /// Typing broadcasts sent, in call order.
    pub fn broadcasts(&self) -> Vec<(String, TypingPayload)> {
        self.inner().broadcasts.clone()
    }

    /// Cause the next subscribe() to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        self.inner().fail_next_subscribe = Some(error.to_string());
    }

    /// Cause every subscribe() to fail until cleared with `None`.
    pub fn fail_all_subscribes(&self, error: Option<&str>) {
        self.inner().fail_all_subscribes = error.map(str::to_string);
    }

    /// Cause the next broadcast() to fail with the given error.
    pub fn fail_next_broadcast(&self, error: &str) {
        self.inner().fail_next_broadcast = Some(error.to_string());
    }

    /// Close a subscription from the backend side, as a dropped socket would.
    ///
    /// Nothing is recorded in `unsubscribed`; the observer still has to be
    /// told through `subscription_lost`.
    pub fn drop_subscription(&self, handle: StreamHandle) -> bool {
        self.inner().active.remove(&handle).is_some()
    }

    /// Clear all state.
    pub fn reset(&self) {
        *self.inner() = MockBackendInner::default();
    }
}

impl Clone for MockBackend {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RealtimeBackend for MockBackend {
    async fn subscribe(&self, spec: &ChannelSpec) -> Result<StreamHandle, BackendError> {
        let mut inner = self.inner();
        inner.subscribe_calls += 1;

        // Check for forced failure
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(BackendError::SubscribeFailed(error));
        }
        if let Some(error) = &inner.fail_all_subscribes {
            return Err(BackendError::SubscribeFailed(error.clone()));
        }

        inner.next_handle += 1;
        let handle = StreamHandle::new(inner.next_handle);
        inner.active.insert(handle, spec.clone());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: StreamHandle) -> Result<(), BackendError> {
        let mut inner = self.inner();
        inner.unsubscribed.push(handle);
        inner
            .active
            .remove(&handle)
            .map(|_| ())
            .ok_or(BackendError::UnknownStream(handle))
    }

    async fn broadcast(&self, channel: &str, payload: &TypingPayload) -> Result<(), BackendError> {
        let mut inner = self.inner();
        if let Some(error) = inner.fail_next_broadcast.take() {
            return Err(BackendError::BroadcastFailed(error));
        }
        inner.broadcasts.push((channel.to_string(), *payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::Chunk;
    use dm_types::{ConversationId, UserId};

    fn spec(n: usize) -> ChannelSpec {
        (0..n)
            .map(|_| ConversationId::new())
            .collect::<Chunk>()
            .channel_spec()
    }

    // ===========================================
    // MockBackend Basic Tests
    // ===========================================

    #[tokio::test]
    async fn subscribe_assigns_distinct_handles() {
        let backend = MockBackend::new();

        let a = backend.subscribe(&spec(2)).await.unwrap();
        let b = backend.subscribe(&spec(3)).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(backend.active_subscriptions().len(), 2);
        assert_eq!(backend.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let backend = MockBackend::new();
        let handle = backend.subscribe(&spec(1)).await.unwrap();

        backend.unsubscribe(handle).await.unwrap();

        assert!(backend.active_subscriptions().is_empty());
        assert_eq!(backend.unsubscribed(), vec![handle]);
        assert!(matches!(
            backend.unsubscribe(handle).await,
            Err(BackendError::UnknownStream(_))
        ));
    }

    #[tokio::test]
    async fn broadcasts_recorded() {
        let backend = MockBackend::new();
        let payload = TypingPayload {
            user_id: UserId::new(),
            is_typing: true,
            timestamp: chrono::Utc::now(),
        };

        backend.broadcast("typing:abc", &payload).await.unwrap();

        assert_eq!(backend.broadcasts(), vec![("typing:abc".to_string(), payload)]);
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_subscribe_failure_is_one_shot() {
        let backend = MockBackend::new();
        backend.fail_next_subscribe("rate limited");

        let result = backend.subscribe(&spec(1)).await;
        assert!(matches!(result, Err(BackendError::SubscribeFailed(_))));

        // Next subscribe should work
        backend.subscribe(&spec(1)).await.unwrap();
    }

    #[tokio::test]
    async fn forced_broadcast_failure_not_recorded() {
        let backend = MockBackend::new();
        let payload = TypingPayload {
            user_id: UserId::new(),
            is_typing: false,
            timestamp: chrono::Utc::now(),
        };
        backend.fail_next_broadcast("channel closed");

        let result = backend.broadcast("typing:abc", &payload).await;
        assert_eq!(
            result,
            Err(BackendError::BroadcastFailed("channel closed".into()))
        );
        assert!(backend.broadcasts().is_empty());

        backend.broadcast("typing:abc", &payload).await.unwrap();
        assert_eq!(backend.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn persistent_subscribe_failure() {
        let backend = MockBackend::new();
        backend.fail_all_subscribes(Some("offline"));

        for _ in 0..3 {
            assert!(backend.subscribe(&spec(1)).await.is_err());
        }

        backend.fail_all_subscribes(None);
        backend.subscribe(&spec(1)).await.unwrap();
    }

    #[tokio::test]
    async fn backend_side_drop_not_recorded_as_unsubscribe() {
        let backend = MockBackend::new();
        let handle = backend.subscribe(&spec(1)).await.unwrap();

        assert!(backend.drop_subscription(handle));

        assert!(backend.active_subscriptions().is_empty());
        assert!(backend.unsubscribed().is_empty());
        assert!(!backend.drop_subscription(handle));
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn clone_shares_state() {
        let backend1 = MockBackend::new();
        let backend2 = backend1.clone();

        backend1.subscribe(&spec(1)).await.unwrap();

        assert_eq!(backend2.active_subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_all() {
        let backend = MockBackend::new();
        backend.subscribe(&spec(1)).await.unwrap();
        backend.fail_next_subscribe("later");

        backend.reset();

        assert!(backend.active_subscriptions().is_empty());
        assert_eq!(backend.subscribe_calls(), 0);
        backend.subscribe(&spec(1)).await.unwrap();
    }
}

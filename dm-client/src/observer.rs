//! The realtime observer actor.
//!
//! One tokio task owns every piece of realtime state: the subscription
//! planner, the event router, the typing coordinator, the link state
//! machine and the set of in-flight sends. Everything else talks to it
//! through an unbounded command channel, so there is exactly one writer and
//! no locks.
//!
//! Timers are deadlines held by those components. The task sleeps until the
//! earliest one, or until a command arrives, whichever comes first. When the
//! task stops, its state is dropped and with it every timer, so nothing can
//! fire after shutdown.

use chrono::Utc;
use dm_core::reconcile;
use dm_core::{
    Chunk, ConfigError, EventRouter, LinkAction, LinkEvent, LinkState, RealtimeConfig,
    RealtimeError, Routed, SubscriptionPlanner, SyncEvent, TypingAction, TypingCoordinator,
};
use dm_types::{
    typing_channel, ConversationId, DeliveryStatus, Message, MessageId, Nonce, RawEvent,
    TypingPayload, UserId,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{RealtimeBackend, StreamHandle};

/// Errors returned by the [`Observer`] handle.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// The observer has shut down.
    #[error("observer is closed")]
    Closed,

    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

enum Command {
    SetVisible(BTreeSet<ConversationId>),
    SetActiveThread(Option<ConversationId>),
    Foreground,
    Background,
    SetTyping {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    Deliver(RawEvent),
    DeliverJson(Vec<u8>),
    SubscriptionLost {
        handle: StreamHandle,
        reason: String,
    },
    TrackOptimistic(Message),
    ConfirmSent {
        nonce: Nonce,
        server: Message,
    },
    MarkFailed(Nonce),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running observer.
///
/// Cheap to clone. Every input is a non-blocking send; results arrive on
/// the [`OutputStream`]. Dropping every clone shuts the observer down.
#[derive(Debug, Clone)]
pub struct Observer {
    commands: mpsc::UnboundedSender<Command>,
}

/// Events produced by the observer, ordered per conversation.
///
/// Yields `None` once the observer has shut down.
#[derive(Debug)]
pub struct OutputStream {
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

impl OutputStream {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }

    /// Take every event that is ready.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Observer {
    /// Start an observer on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::Config`] if the configuration is invalid.
    pub fn spawn(
        config: Arc<RealtimeConfig>,
        backend: Arc<dyn RealtimeBackend>,
        local_user: UserId,
    ) -> Result<(Self, OutputStream), ObserverError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (output, events) = mpsc::unbounded_channel();
        let actor = Actor::new(config, backend, local_user, output);
        tokio::spawn(actor.run(command_rx));

        tracing::info!(%local_user, "observer started");
        Ok((Self { commands }, OutputStream { events }))
    }

    /// Replace the set of conversations on screen.
    pub fn set_visible_conversations(
        &self,
        ids: impl IntoIterator<Item = ConversationId>,
    ) -> Result<(), ObserverError> {
        self.send(Command::SetVisible(ids.into_iter().collect()))
    }

    /// Set (or clear) the thread the user is reading.
    pub fn set_active_thread(&self, id: Option<ConversationId>) -> Result<(), ObserverError> {
        self.send(Command::SetActiveThread(id))
    }

    /// App came to the foreground.
    pub fn lifecycle_foreground(&self) -> Result<(), ObserverError> {
        self.send(Command::Foreground)
    }

    /// App went to the background.
    pub fn lifecycle_background(&self) -> Result<(), ObserverError> {
        self.send(Command::Background)
    }

    /// The local user started or stopped typing in a conversation.
    pub fn set_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), ObserverError> {
        self.send(Command::SetTyping {
            conversation_id,
            is_typing,
        })
    }

    /// Feed an event received from the backend.
    pub fn deliver(&self, event: RawEvent) -> Result<(), ObserverError> {
        self.send(Command::Deliver(event))
    }

    /// Feed an untyped payload received from the backend.
    pub fn deliver_json(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ObserverError> {
        self.send(Command::DeliverJson(bytes.into()))
    }

    /// Report that the backend dropped a subscription.
    pub fn subscription_lost(
        &self,
        handle: StreamHandle,
        reason: impl Into<String>,
    ) -> Result<(), ObserverError> {
        self.send(Command::SubscriptionLost {
            handle,
            reason: reason.into(),
        })
    }

    /// Start tracking an optimistic message until the server confirms it.
    pub fn track_optimistic(&self, message: Message) -> Result<(), ObserverError> {
        self.send(Command::TrackOptimistic(message))
    }

    /// The send request for `nonce` returned the server's copy.
    ///
    /// The confirmed message is emitted as `MessageAdded`; a later echo of
    /// it on the change stream is not emitted again.
    pub fn confirm_sent(&self, nonce: Nonce, server: Message) -> Result<(), ObserverError> {
        self.send(Command::ConfirmSent { nonce, server })
    }

    /// The send request for `nonce` failed.
    pub fn mark_failed(&self, nonce: Nonce) -> Result<(), ObserverError> {
        self.send(Command::MarkFailed(nonce))
    }

    /// Stop typing, unsubscribe everything and close the output stream.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            // A dropped ack means another shutdown got there first
            let _ = done.await;
        }
    }

    /// Whether the observer has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), ObserverError> {
        self.commands
            .send(command)
            .map_err(|_| ObserverError::Closed)
    }
}

struct Outgoing {
    message: Message,
    fail_at: Instant,
}

/// A send confirmed by its request whose stream echo has not arrived yet.
struct Confirmed {
    conversation_id: ConversationId,
    message_id: MessageId,
    forget_at: Instant,
}

struct Actor {
    config: Arc<RealtimeConfig>,
    backend: Arc<dyn RealtimeBackend>,
    local_user: UserId,
    planner: SubscriptionPlanner,
    router: EventRouter,
    typing: TypingCoordinator,
    link: LinkState,
    retry_at: Option<Instant>,
    handles: HashMap<Chunk, StreamHandle>,
    outgoing: HashMap<Nonce, Outgoing>,
    confirmed: HashMap<Nonce, Confirmed>,
    backgrounded: bool,
    output: Option<mpsc::UnboundedSender<SyncEvent>>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Actor {
    fn new(
        config: Arc<RealtimeConfig>,
        backend: Arc<dyn RealtimeBackend>,
        local_user: UserId,
        output: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            planner: SubscriptionPlanner::new(&config),
            router: EventRouter::new(&config),
            typing: TypingCoordinator::new(&config),
            config,
            backend,
            local_user,
            link: LinkState::default(),
            retry_at: None,
            handles: HashMap::new(),
            outgoing: HashMap::new(),
            confirmed: HashMap::new(),
            backgrounded: false,
            output: Some(output),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        tracing::debug!("all observer handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                () = timer => self.on_timers(now()).await,
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        let now = now();
        match command {
            Command::SetVisible(ids) => self.set_visible(ids, now),
            Command::SetActiveThread(id) => self.router.set_active_thread(id),
            Command::Foreground => {
                if self.backgrounded {
                    self.backgrounded = false;
                    tracing::info!("foreground: resyncing subscriptions");
                    self.on_link(LinkEvent::Resume).await;
                }
            }
            Command::Background => {
                self.backgrounded = true;
                tracing::info!("background: stopping local typing");
                let actions = self.typing.stop_all(now);
                self.run_typing(actions).await;
            }
            Command::SetTyping {
                conversation_id,
                is_typing,
            } => {
                if self.backgrounded && is_typing {
                    tracing::debug!(%conversation_id, "ignoring typing while backgrounded");
                    return;
                }
                let actions = self.typing.set_local(conversation_id, is_typing, now);
                self.run_typing(actions).await;
            }
            Command::Deliver(raw) => {
                let routed = self.router.route(raw, now);
                self.on_routed(routed, now).await;
            }
            Command::DeliverJson(bytes) => {
                let routed = self.router.route_json(&bytes, now);
                self.on_routed(routed, now).await;
            }
            Command::SubscriptionLost { handle, reason } => {
                let chunk = self
                    .handles
                    .iter()
                    .find(|(_, h)| **h == handle)
                    .map(|(chunk, _)| chunk.clone());
                match chunk {
                    Some(chunk) => {
                        self.handles.remove(&chunk);
                        tracing::warn!(%handle, reason = %reason, "subscription lost");
                        let error = RealtimeError::SubscriptionFailure(reason);
                        self.on_link(LinkEvent::SubscriptionFailed { error }).await;
                    }
                    None => tracing::debug!(%handle, "loss reported for retired subscription"),
                }
            }
            Command::TrackOptimistic(message) => match message.nonce {
                Some(nonce) => {
                    let fail_at = now + self.config.sending_timeout();
                    self.outgoing.insert(nonce, Outgoing { message, fail_at });
                }
                None => tracing::debug!(message_id = %message.id, "not tracking message without nonce"),
            },
            Command::ConfirmSent { nonce, server } => match self.outgoing.remove(&nonce) {
                Some(outgoing) => {
                    let confirmed = reconcile::reconcile(&outgoing.message, &server);
                    self.router.record_status(&confirmed);
                    self.confirmed.insert(
                        nonce,
                        Confirmed {
                            conversation_id: confirmed.conversation_id,
                            message_id: confirmed.id,
                            forget_at: now + self.config.sending_timeout(),
                        },
                    );
                    self.push(SyncEvent::MessageAdded(confirmed));
                }
                None => tracing::debug!(%nonce, "confirmation for untracked send"),
            },
            Command::MarkFailed(nonce) => self.fail_send(nonce),
            Command::Shutdown(_) => {}
        }
    }

    fn set_visible(&mut self, ids: BTreeSet<ConversationId>, now: Instant) {
        let before = self.planner.visible().clone();
        let request = self.planner.request(ids, now);
        tracing::debug!(?request, "visible set requested");

        let visible = self.planner.visible().clone();
        for gone in before.difference(&visible) {
            self.typing.forget_conversation(*gone);
        }
        self.confirmed
            .retain(|_, c| visible.contains(&c.conversation_id));
        self.router.set_visible(visible);
    }

    async fn on_routed(&mut self, routed: Routed, now: Instant) {
        for event in routed.events {
            self.emit(event);
        }
        if let Some(signal) = routed.typing {
            if signal.user_id == self.local_user {
                return;
            }
            let change = self.typing.observe_remote(
                signal.conversation_id,
                signal.user_id,
                signal.is_typing,
                signal.sent_at,
                now,
            );
            self.run_typing(change.into_iter().collect()).await;
        }
    }

    async fn on_timers(&mut self, now: Instant) {
        if let Some(diff) = self.planner.poll(now) {
            tracing::info!(
                teardown = diff.teardown.len(),
                establish = diff.establish.len(),
                "applying subscription changes"
            );
            self.on_link(LinkEvent::SubscribeRequested).await;
            for chunk in diff.teardown {
                if let Some(handle) = self.handles.remove(&chunk) {
                    self.unsubscribe(handle).await;
                }
            }
            let outcome = self.ensure_subscribed().await;
            self.on_link(outcome).await;
        }

        for event in self.router.flush_due(now) {
            self.emit(event);
        }

        let actions = self.typing.poll(now);
        self.run_typing(actions).await;

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            self.on_link(LinkEvent::RetryTimer).await;
        }

        let expired: Vec<Nonce> = self
            .outgoing
            .iter()
            .filter(|(_, o)| o.fail_at <= now)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in expired {
            tracing::warn!(%nonce, "send timed out");
            self.fail_send(nonce);
        }
        self.confirmed.retain(|_, c| c.forget_at > now);
    }

    async fn on_link(&mut self, event: LinkEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let state = std::mem::take(&mut self.link);
            let (state, actions) = state.on_event(event, &self.config.reconnect);
            self.link = state;

            for action in actions {
                match action {
                    LinkAction::Resubscribe => queue.push_back(self.resubscribe().await),
                    LinkAction::ScheduleRetry { delay } => self.retry_at = Some(now() + delay),
                    LinkAction::CancelRetry => self.retry_at = None,
                    LinkAction::Emit(error) => self.emit(SyncEvent::Error(error)),
                }
            }
        }
    }

    /// Tear down every subscription and re-establish the planned chunks.
    async fn resubscribe(&mut self) -> LinkEvent {
        let diff = self.planner.resync();
        tracing::info!(chunks = diff.establish.len(), "resubscribing");
        let handles: Vec<StreamHandle> = self.handles.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.unsubscribe(handle).await;
        }
        self.ensure_subscribed().await
    }

    /// Subscribe every planned chunk that has no live handle.
    async fn ensure_subscribed(&mut self) -> LinkEvent {
        let missing: Vec<Chunk> = self
            .planner
            .chunks()
            .iter()
            .filter(|chunk| !self.handles.contains_key(*chunk))
            .cloned()
            .collect();

        let mut failure = None;
        for chunk in missing {
            match self.backend.subscribe(&chunk.channel_spec()).await {
                Ok(handle) => {
                    tracing::debug!(%handle, ids = chunk.len(), "subscribed");
                    self.handles.insert(chunk, handle);
                }
                Err(err) => {
                    tracing::warn!(error = %err, ids = chunk.len(), "subscribe failed");
                    failure = Some(RealtimeError::from(err));
                }
            }
        }

        match failure {
            Some(error) => LinkEvent::SubscriptionFailed { error },
            None => LinkEvent::SubscribeSucceeded,
        }
    }

    async fn unsubscribe(&self, handle: StreamHandle) {
        if let Err(err) = self.backend.unsubscribe(handle).await {
            tracing::debug!(%handle, error = %err, "unsubscribe failed");
        }
    }

    async fn run_typing(&mut self, actions: Vec<TypingAction>) {
        for action in actions {
            match action {
                TypingAction::Broadcast {
                    conversation_id,
                    is_typing,
                } => {
                    let payload = TypingPayload {
                        user_id: self.local_user,
                        is_typing,
                        timestamp: Utc::now(),
                    };
                    let channel = typing_channel(conversation_id);
                    if let Err(err) = self.backend.broadcast(&channel, &payload).await {
                        tracing::warn!(%conversation_id, error = %err, "typing broadcast failed");
                    }
                }
                TypingAction::Changed {
                    conversation_id,
                    user_id,
                    is_typing,
                } => self.emit(SyncEvent::Typing {
                    conversation_id,
                    user_id,
                    is_typing,
                }),
            }
        }
    }

    fn fail_send(&mut self, nonce: Nonce) {
        let Some(outgoing) = self.outgoing.remove(&nonce) else {
            tracing::debug!(%nonce, "failure for untracked send");
            return;
        };
        let mut failed = outgoing.message;
        match reconcile::try_update_delivery_status(&mut failed, DeliveryStatus::Failed) {
            Ok(()) => self.emit(SyncEvent::MessageUpdated(failed)),
            Err(err) => tracing::debug!(%nonce, error = %err, "send not failed"),
        }
    }

    /// Send an event to the application, reconciling echoes of local sends.
    fn emit(&mut self, event: SyncEvent) {
        let event = match event {
            SyncEvent::MessageAdded(message) => match self.reconcile_echo(message) {
                Some(message) => SyncEvent::MessageAdded(message),
                None => return,
            },
            other => other,
        };
        self.push(event);
    }

    fn push(&self, event: SyncEvent) {
        if let Some(output) = &self.output {
            if output.send(event).is_err() {
                tracing::debug!("output stream dropped");
            }
        }
    }

    /// Merge an inserted message with the local send it echoes.
    ///
    /// Returns `None` for the echo of a send already confirmed and emitted.
    fn reconcile_echo(&mut self, server: Message) -> Option<Message> {
        let Some(nonce) = server.nonce else {
            return Some(server);
        };
        if self
            .confirmed
            .get(&nonce)
            .is_some_and(|c| c.message_id == server.id)
        {
            self.confirmed.remove(&nonce);
            tracing::debug!(%nonce, message_id = %server.id, "echo of confirmed send dropped");
            return None;
        }
        match self.outgoing.get(&nonce) {
            Some(outgoing) if outgoing.message.conversation_id == server.conversation_id => {
                let merged = reconcile::reconcile(&outgoing.message, &server);
                self.outgoing.remove(&nonce);
                tracing::debug!(%nonce, message_id = %merged.id, "local send confirmed by echo");
                Some(merged)
            }
            _ => Some(server),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.planner.next_deadline(),
            self.router.next_deadline(),
            self.typing.next_deadline(),
            self.retry_at,
            self.outgoing.values().map(|o| o.fail_at).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn teardown(&mut self) {
        let actions = self.typing.stop_all(now());
        self.run_typing(actions).await;

        let handles: Vec<StreamHandle> = self.handles.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            self.unsubscribe(handle).await;
        }

        let state = std::mem::take(&mut self.link);
        self.link = state.on_event(LinkEvent::Shutdown, &self.config.reconnect).0;
        self.retry_at = None;
        self.outgoing.clear();
        self.confirmed.clear();
        self.output = None;
        tracing::info!(unsubscribed = count, "observer stopped");
    }
}

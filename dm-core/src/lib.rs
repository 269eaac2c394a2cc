//! # dm-core
//!
//! Pure logic for the dm-sync realtime core (no I/O, instant tests).
//!
//! This crate implements the planners, state machines and reconciliation
//! rules behind realtime direct messaging, without any network access.
//!
//! ## Design Philosophy
//!
//! Every component here is **pure**: it takes the current time as an
//! argument, mutates only its own state, and returns what should happen
//! (events to emit, broadcasts to send, subscriptions to change). Timers are
//! deadlines exposed through `next_deadline()`, never background tasks.
//!
//! The actual I/O is performed by `dm-client`, whose observer owns one of
//! each component and interprets their outputs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod reconcile;
pub mod router;
pub mod state;
pub mod subscription;
pub mod throttle;
pub mod typing;

pub use config::{ConfigError, RealtimeConfig, ReconnectConfig};
pub use error::RealtimeError;
pub use event::SyncEvent;
pub use reconcile::ReconciliationEngine;
pub use router::{EventRouter, Routed, TypingSignal};
pub use state::{LinkAction, LinkEvent, LinkState};
pub use subscription::{
    ChannelSpec, Chunk, Request, SubscriptionDiff, SubscriptionPlanner, TableBinding,
};
pub use throttle::ConversationThrottle;
pub use typing::{TypingAction, TypingCoordinator};

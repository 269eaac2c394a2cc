//! # dm-client
//!
//! Realtime observer for dm-sync direct messaging.
//!
//! This is the crate applications embed. It runs the pure components from
//! `dm-core` inside a single tokio task and drives a pluggable backend.
//!
//! ## Features
//!
//! - **Visible-set subscriptions**: debounced, chunked, stable across scrolls
//! - **Typing indicators**: keepalive, auto-stop, stale-signal protection
//! - **Optimistic sends**: server echoes reconciled by nonce, timeouts fail
//! - **Resilience**: backoff with jitter, full resync on foreground
//!
//! ## Example
//!
//! ```ignore
//! use dmsync_client::{MockBackend, Observer};
//!
//! let (observer, mut events) = Observer::spawn(config, Arc::new(MockBackend::new()), me)?;
//! observer.set_visible_conversations(visible_ids)?;
//!
//! while let Some(event) = events.recv().await {
//!     render(event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod observer;

pub use backend::{BackendError, MockBackend, RealtimeBackend, StreamHandle};
pub use observer::{Observer, ObserverError, OutputStream};

pub use dm_core::{RealtimeConfig, RealtimeError, SyncEvent};

//! Error types for dm-sync payloads.

use thiserror::Error;

use crate::DeliveryStatus;

/// Errors decoding raw realtime payloads.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload is not valid JSON or does not match the expected shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A field needed for routing is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The table/operation pair is not part of the change stream contract.
    #[error("unsupported operation {op} on {table}")]
    UnsupportedOperation {
        /// Table name.
        table: String,
        /// Operation name.
        op: String,
    },

    /// Broadcast arrived on a channel that is not a typing channel.
    #[error("invalid broadcast channel: {0}")]
    InvalidChannel(String),
}

/// A delivery-status change that is not a forward step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid delivery transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// Current status.
    pub from: DeliveryStatus,
    /// Requested status.
    pub to: DeliveryStatus,
}

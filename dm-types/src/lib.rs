//! # dm-types
//!
//! Data types for the dm-sync realtime messaging core.
//!
//! This crate provides the foundational types used across all dm-sync crates:
//! - [`ConversationId`], [`MessageId`], [`UserId`], [`Nonce`] - Identity types
//! - [`Message`], [`DeliveryStatus`], [`Conversation`], [`ReadReceipt`] - Records
//! - [`RawEvent`] - Change-stream and typing payloads as delivered by the backend
//! - [`EventError`] - Payload decoding errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod ids;
mod message;

pub use error::{EventError, InvalidTransition};
pub use event::{
    typing_channel, ChangeEvent, ChangeOp, RawEvent, Table, TypingBroadcast, TypingPayload,
    TYPING_CHANNEL_PREFIX,
};
pub use ids::{ConversationId, MessageId, Nonce, UserId};
pub use message::{
    Attachment, AttachmentKind, Conversation, DeliveryStatus, Message, ReadReceipt, SystemKind,
};

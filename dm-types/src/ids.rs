//! Identity types for dm-sync.
//!
//! Every identifier is a UUID v4 newtype. They serialize as plain UUID
//! strings so they line up with the backend's row ids.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the hyphenated string form.
            pub fn parse(s: &str) -> Option<Self> {
                uuid::Uuid::parse_str(s).ok().map(Self)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for a conversation.
    ConversationId
);

uuid_id!(
    /// A unique identifier for a message.
    ///
    /// Optimistic messages get a locally generated id that is replaced by
    /// the server id on reconciliation.
    MessageId
);

uuid_id!(
    /// A unique identifier for a user.
    UserId
);

uuid_id!(
    /// Client-generated token correlating a local message with its server echo.
    ///
    /// Generated fresh for every outgoing message and never reused. Not a
    /// server identifier.
    Nonce
);

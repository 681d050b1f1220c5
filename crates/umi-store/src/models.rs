//! Domain model structs held by the stores.
//!
//! Every struct derives `Serialize` so it can be handed directly to the UI
//! layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use umi_shared::protocol::ChatMessage;
use umi_shared::{LocalId, MessageId, UserId};

pub use umi_shared::protocol::{Notification, NotificationUpdate, UserSummary};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Where an optimistic send stands. Messages received from the server are
/// always `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Identity of a message in the store: the server id once known, the
/// temporary id before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKey {
    Server(MessageId),
    Local(LocalId),
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "{id}"),
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: MessageKey,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    /// Server timestamp, or the local send time for optimistic entries.
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub status: DeliveryStatus,
}

impl Message {
    pub fn server_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self.key {
            MessageKey::Local(id) => Some(id),
            MessageKey::Server(_) => None,
        }
    }

    /// Whether this message belongs to the conversation with `peer`.
    pub fn involves(&self, peer: UserId) -> bool {
        self.sender_id == peer || self.recipient_id == peer
    }
}

impl From<ChatMessage> for Message {
    fn from(m: ChatMessage) -> Self {
        Self {
            key: MessageKey::Server(m.id),
            sender_id: m.sender.id,
            recipient_id: m.recipient.id,
            content: m.content,
            timestamp: m.timestamp,
            read: m.read,
            status: DeliveryStatus::Confirmed,
        }
    }
}

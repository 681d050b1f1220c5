use serde::Serialize;
use tokio::sync::mpsc;

use umi_shared::{LocalId, MessageId, UserId};

/// State changes a UI layer re-renders on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    ConversationChanged { peer: UserId },
    MessageConfirmed { local: LocalId, id: MessageId },
    MessageFailed { local: LocalId, error: String },
    MessageRead { id: MessageId },
    UnreadChanged { peer: UserId, count: u32 },
    PresenceChanged { user: UserId, online: bool },
    PresenceCleared,
    NotificationsChanged { unread: u32 },
}

/// Where components emit [`ClientEvent`]s. A disabled sink drops them.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event) {
                tracing::error!(event = ?e.0, "Failed to emit event");
            }
        }
    }
}

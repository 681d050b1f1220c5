use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PayloadError;
use crate::types::{LocalId, MessageId, NotificationId, UserId};

/// Reference to a user by id, as nested in message payloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub id: UserId,
}

impl From<UserId> for UserRef {
    fn from(id: UserId) -> Self {
        Self { id }
    }
}

/// A persisted chat message, from REST history or the messages queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: UserRef,
    pub recipient: UserRef,
    pub content: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "isRead")]
    pub read: bool,
    /// Temporary id of the optimistic entry this message confirms, when the
    /// broker echoes it back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<LocalId>,
}

impl ChatMessage {
    /// The other participant, seen from `me`.
    pub fn peer_of(&self, me: UserId) -> UserId {
        if self.sender.id == me {
            self.recipient.id
        } else {
            self.sender.id
        }
    }
}

/// Body published to `/app/chat.sendMessage`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub sender: UserRef,
    pub recipient: UserRef,
    pub content: String,
    pub read: bool,
    pub client_ref: LocalId,
}

/// Read receipt, published to `/app/chat.messageRead` and received on the
/// `messageRead` queue. The broker may also deliver the updated message
/// itself, hence the `id` alias.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(alias = "id")]
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    #[serde(default)]
    pub sender_img_url: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

/// A pushed notification together with the server's canonical unread count
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationUpdate {
    pub notification: Notification,
    pub unread_count: u32,
}

/// Envelope delivered on the notifications topic. Any other `type` decodes
/// to `Unknown`, whatever its payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    NotificationUpdate(NotificationUpdate),
    Unknown,
}

impl<'de> Deserialize<'de> for NotificationEvent {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            payload: serde_json::Value,
        }

        let envelope = Envelope::deserialize(d)?;
        match envelope.kind.as_str() {
            "NOTIFICATION_UPDATE" => serde_json::from_value(envelope.payload)
                .map(Self::NotificationUpdate)
                .map_err(de::Error::custom),
            _ => Ok(Self::Unknown),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountResponse {
    pub count: u32,
}

/// Entry of the user directory (`/users/all`, `/users/search`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub img_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, PayloadError> {
    Ok(serde_json::from_str(body)?)
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, PayloadError> {
    Ok(serde_json::to_string(value)?)
}

/// Timestamps are RFC 3339, but the backend also emits zone-less local
/// date-times, which are taken as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

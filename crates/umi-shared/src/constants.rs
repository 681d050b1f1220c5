use crate::types::UserId;

/// Protocol versions offered in the STOMP CONNECT frame
pub const STOMP_ACCEPT_VERSION: &str = "1.2";

/// Default REST base URL (local development backend)
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Default broker endpoint (local development backend). The backend mounts
/// STOMP at `/ws` behind SockJS; a plain WebSocket client has to use the
/// raw transport path `/ws/websocket` under it.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

/// Delay between automatic reconnection attempts in milliseconds
pub const RECONNECT_DELAY_MS: u64 = 5_000;

/// Automatic reconnection attempts before giving up with `Failed`
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Heart-beat interval offered in both directions, in milliseconds
pub const HEARTBEAT_MS: u64 = 4_000;

/// Time allowed for the broker to answer CONNECT, in milliseconds
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Per-request REST timeout in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Messages requested per history page
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Publish destinations
pub const DEST_SEND_MESSAGE: &str = "/app/chat.sendMessage";
pub const DEST_MESSAGE_READ: &str = "/app/chat.messageRead";

/// Broadcast topic carrying presence changes
pub const TOPIC_PRESENCE: &str = "/topic/presence";

/// Incoming chat messages addressed to `user`.
pub fn messages_topic(user: UserId) -> String {
    format!("/user/{user}/queue/messages")
}

/// Read receipts for messages sent by `user`.
pub fn read_receipts_topic(user: UserId) -> String {
    format!("/user/{user}/queue/messageRead")
}

/// Notifications are addressed by username, not by id.
pub fn notifications_topic(username: &str) -> String {
    format!("/user/{username}/topic/notifications")
}

//! Notification list kept in sync with the REST API and the broker push
//! channel.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use umi_net::ConnectionManager;
use umi_shared::constants::notifications_topic;
use umi_shared::protocol::{self, NotificationEvent};
use umi_shared::NotificationId;
use umi_store::{NotificationFeed, NotificationUpdate};

use crate::api::ChatApi;
use crate::error::Result;
use crate::events::{ClientEvent, EventSink};

pub struct NotificationService<A> {
    username: String,
    api: A,
    conn: ConnectionManager,
    feed: NotificationFeed,
    events: EventSink,
}

impl<A: ChatApi> NotificationService<A> {
    pub fn new(
        username: impl Into<String>,
        api: A,
        conn: ConnectionManager,
        events: EventSink,
    ) -> Self {
        Self {
            username: username.into(),
            api,
            conn,
            feed: NotificationFeed::new(),
            events,
        }
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    pub fn unread_count(&self) -> u32 {
        self.feed.unread_count()
    }

    /// Register the per-user notification topic. Envelopes of unknown type
    /// are ignored.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<NotificationUpdate>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = notifications_topic(&self.username);
        self.conn
            .subscribe(topic.clone(), move |delivery| {
                match protocol::decode::<NotificationEvent>(&delivery.body) {
                    Ok(NotificationEvent::NotificationUpdate(update)) => {
                        if tx.send(update).is_err() {
                            debug!("Notification service gone, dropping push");
                        }
                    }
                    Ok(NotificationEvent::Unknown) => {
                        debug!(topic = %delivery.topic, "Ignoring notification event");
                    }
                    Err(e) => {
                        warn!(topic = %delivery.topic, error = %e, "Dropping malformed notification")
                    }
                }
            })
            .await?;
        info!(topic = %topic, "Notification topic registered");
        Ok(rx)
    }

    /// Full resync. The list and the count are fetched concurrently; the
    /// server count wins, and the local count is used if only it failed.
    pub async fn load_initial(&mut self) -> Result<u32> {
        let (items, count) =
            futures::join!(self.api.notifications(), self.api.notification_count());
        let items = items?;
        let count = match count {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Notification count unavailable, counting locally");
                None
            }
        };
        self.feed.replace(items, count);
        self.emit_count();
        Ok(self.feed.unread_count())
    }

    /// Apply a pushed update. Returns whether the list changed.
    pub fn on_push(&mut self, update: NotificationUpdate) -> bool {
        let id = update.notification.id;
        let inserted = self.feed.on_push(update);
        debug!(id = %id, inserted, unread = self.feed.unread_count(), "Notification pushed");
        self.emit_count();
        inserted
    }

    /// Flip one notification locally, then persist it. A REST failure is
    /// returned without undoing the local change.
    pub async fn mark_read(&mut self, id: NotificationId) -> Result<bool> {
        if !self.feed.mark_read(id) {
            return Ok(false);
        }
        self.emit_count();
        self.api.mark_notification_read(id).await?;
        Ok(true)
    }

    /// Flip everything locally, then persist it. Same failure policy as
    /// [`mark_read`](Self::mark_read).
    pub async fn mark_all_read(&mut self) -> Result<usize> {
        let changed = self.feed.mark_all_read();
        self.emit_count();
        self.api.mark_all_notifications_read().await?;
        Ok(changed)
    }

    /// Re-read the unread count without touching the list.
    pub async fn refresh_count(&mut self) -> Result<u32> {
        let count = self.api.notification_count().await?;
        self.feed.set_unread_count(count);
        self.emit_count();
        Ok(count)
    }

    fn emit_count(&self) {
        self.events.emit(ClientEvent::NotificationsChanged {
            unread: self.feed.unread_count(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use umi_net::{memory_transport, ConnectionConfig};
    use umi_shared::protocol::{ChatMessage, UserSummary};
    use umi_shared::{MessageId, UserId};
    use umi_store::Notification;

    use super::*;
    use crate::error::ClientError;

    #[derive(Default)]
    struct FakeState {
        items: Vec<Notification>,
        count: Option<u32>,
        fail_writes: bool,
        marked: Vec<NotificationId>,
        all_marked: bool,
    }

    #[derive(Clone, Default)]
    struct FakeApi(Arc<Mutex<FakeState>>);

    impl FakeApi {
        fn write(&self) -> Result<()> {
            if self.0.lock().unwrap().fail_writes {
                return Err(ClientError::Config("offline".into()));
            }
            Ok(())
        }
    }

    impl ChatApi for FakeApi {
        async fn messages(&self, _peer: UserId, _page: u32, _size: u32) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }

        async fn mark_message_read(&self, _id: MessageId) -> Result<()> {
            Ok(())
        }

        async fn unread_counts(&self) -> Result<HashMap<UserId, u32>> {
            Ok(HashMap::new())
        }

        async fn notifications(&self) -> Result<Vec<Notification>> {
            Ok(self.0.lock().unwrap().items.clone())
        }

        async fn notification_count(&self) -> Result<u32> {
            self.0
                .lock()
                .unwrap()
                .count
                .ok_or_else(|| ClientError::Config("count unavailable".into()))
        }

        async fn mark_notification_read(&self, id: NotificationId) -> Result<()> {
            self.write()?;
            self.0.lock().unwrap().marked.push(id);
            Ok(())
        }

        async fn mark_all_notifications_read(&self) -> Result<()> {
            self.write()?;
            self.0.lock().unwrap().all_marked = true;
            Ok(())
        }

        async fn all_users(&self) -> Result<Vec<UserSummary>> {
            Ok(Vec::new())
        }

        async fn search_users(&self, _query: &str) -> Result<Vec<UserSummary>> {
            Ok(Vec::new())
        }
    }

    fn notification(id: i64, read: bool) -> Notification {
        Notification {
            id: NotificationId(id),
            message: format!("notification {id}"),
            sender_img_url: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            read,
        }
    }

    fn service(api: FakeApi) -> NotificationService<FakeApi> {
        let (connector, _broker) = memory_transport();
        let conn = ConnectionManager::start(connector, ConnectionConfig::default());
        NotificationService::new("kai", api, conn, EventSink::disabled())
    }

    #[tokio::test]
    async fn test_load_initial_prefers_server_count() {
        let api = FakeApi::default();
        {
            let mut state = api.0.lock().unwrap();
            state.items = vec![notification(1, false), notification(2, true)];
            state.count = Some(7);
        }
        let mut service = service(api);
        assert_eq!(service.load_initial().await.unwrap(), 7);
        assert_eq!(service.feed().len(), 2);
    }

    #[tokio::test]
    async fn test_load_initial_falls_back_to_local_count() {
        let api = FakeApi::default();
        api.0.lock().unwrap().items = vec![notification(1, false), notification(2, false)];
        let mut service = service(api);
        assert_eq!(service.load_initial().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_mark_all_read_clears_five_unread() {
        let api = FakeApi::default();
        api.0.lock().unwrap().items = (1..=5).map(|i| notification(i, false)).collect();
        let mut service = service(api.clone());
        service.load_initial().await.unwrap();
        assert_eq!(service.unread_count(), 5);

        assert_eq!(service.mark_all_read().await.unwrap(), 5);
        assert_eq!(service.unread_count(), 0);
        assert!(service.feed().items().iter().all(|n| n.read));
        assert!(api.0.lock().unwrap().all_marked);
    }

    #[tokio::test]
    async fn test_mark_read_failure_keeps_local_flip() {
        let api = FakeApi::default();
        {
            let mut state = api.0.lock().unwrap();
            state.items = vec![notification(1, false)];
            state.count = Some(1);
            state.fail_writes = true;
        }
        let mut service = service(api);
        service.load_initial().await.unwrap();

        assert!(service.mark_read(NotificationId(1)).await.is_err());
        assert!(service.feed().get(NotificationId(1)).unwrap().read);
        assert_eq!(service.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_unknown_skips_request() {
        let api = FakeApi::default();
        let mut service = service(api.clone());
        assert!(!service.mark_read(NotificationId(9)).await.unwrap());
        assert!(api.0.lock().unwrap().marked.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_count() {
        let api = FakeApi::default();
        api.0.lock().unwrap().count = Some(4);
        let mut service = service(api);
        assert_eq!(service.refresh_count().await.unwrap(), 4);
        assert_eq!(service.unread_count(), 4);
    }

    #[tokio::test]
    async fn test_pushes_arrive_from_topic() {
        let (connector, mut broker) = memory_transport();
        let config = ConnectionConfig {
            heartbeat: Duration::ZERO,
            ..ConnectionConfig::default()
        };
        let conn = ConnectionManager::start(connector, config);
        let mut service =
            NotificationService::new("kai", FakeApi::default(), conn.clone(), EventSink::disabled());
        let mut pushes = service.subscribe().await.unwrap();

        let pending = tokio::spawn(async move { conn.connect().await });
        let mut end = broker.accept().await.unwrap();
        end.complete_handshake().await.unwrap();
        pending.await.unwrap().unwrap();

        let sub = end.recv_frame().await.unwrap();
        let topic = "/user/kai/topic/notifications";
        assert_eq!(sub.get("destination"), Some(topic));
        let id = sub.get("id").unwrap().to_string();

        end.deliver(&id, topic, r#"{"type":"FRIEND_REQUEST","payload":{"from":9}}"#)
            .await;
        let update = NotificationUpdate {
            notification: notification(3, false),
            unread_count: 6,
        };
        let body = protocol::encode(&NotificationEvent::NotificationUpdate(update.clone())).unwrap();
        end.deliver(&id, topic, &body).await;

        let received = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, update);
        assert!(service.on_push(received));
        assert_eq!(service.unread_count(), 6);
        assert_eq!(service.feed().items()[0].id, NotificationId(3));
    }
}

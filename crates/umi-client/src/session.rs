//! Active chat session.
//!
//! [`ChatSession`] ties the broker connection, the conversation store and the
//! presence tracker together for the signed-in user. It is owned by a single
//! task: broker handlers only decode and forward [`Inbound`] events into a
//! channel, and the owner feeds them back through
//! [`handle_inbound`](ChatSession::handle_inbound).
//!
//! History fetches are split in two so the owner never holds the session
//! across a REST call: [`select_peer`](ChatSession::select_peer) returns a
//! [`PageRequest`], the request is fetched anywhere, and the response is
//! handed to [`apply_page`](ChatSession::apply_page), which drops it if the
//! user has switched conversations in the meantime.

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use umi_net::{ConnectionManager, ConnectionStatus, Delivery, PresenceTracker};
use umi_shared::constants::{
    messages_topic, read_receipts_topic, DEST_MESSAGE_READ, DEST_SEND_MESSAGE, TOPIC_PRESENCE,
};
use umi_shared::protocol::{
    self, ChatMessage, PresenceEvent, ReadReceipt, SendMessage, UserRef, UserSummary,
};
use umi_shared::{LocalId, MessageId, UserId};
use umi_store::{AppendOutcome, ConversationStore, MergeOutcome, Message, PageState};

use crate::api::ChatApi;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventSink};

/// Broker events forwarded to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ChatMessage),
    ReadReceipt(ReadReceipt),
    Presence(PresenceEvent),
}

/// A history page to fetch for the conversation that was active when the
/// request was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub peer: UserId,
    pub page: u32,
    pub size: u32,
    generation: u64,
}

impl PageRequest {
    pub async fn fetch<A: ChatApi>(self, api: &A) -> PageResponse {
        let result = api.messages(self.peer, self.page, self.size).await;
        PageResponse {
            request: self,
            result,
        }
    }
}

#[derive(Debug)]
pub struct PageResponse {
    pub request: PageRequest,
    pub result: Result<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Applied(MergeOutcome),
    /// The response belongs to a conversation that is no longer selected.
    Stale,
}

pub struct ChatSession<A> {
    me: UserId,
    api: A,
    conn: ConnectionManager,
    store: ConversationStore,
    presence: PresenceTracker,
    selected: Option<UserId>,
    generation: u64,
    page_size: u32,
    events: EventSink,
}

impl<A: ChatApi> ChatSession<A> {
    pub fn new(
        me: UserId,
        api: A,
        conn: ConnectionManager,
        page_size: u32,
        events: EventSink,
    ) -> Self {
        Self {
            me,
            api,
            conn,
            store: ConversationStore::new(me),
            presence: PresenceTracker::new(),
            selected: None,
            generation: 0,
            page_size,
            events,
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn selected(&self) -> Option<UserId> {
        self.selected
    }

    // -----------------------------------------------------------------------
    // Broker wiring
    // -----------------------------------------------------------------------

    /// Register the chat topics. Subscriptions queue until the connection is
    /// up and survive reconnects.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Inbound>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let messages = tx.clone();
        self.conn
            .subscribe(messages_topic(self.me), move |d| {
                forward(&messages, &d, Inbound::Message)
            })
            .await?;

        let receipts = tx.clone();
        self.conn
            .subscribe(read_receipts_topic(self.me), move |d| {
                forward(&receipts, &d, Inbound::ReadReceipt)
            })
            .await?;

        self.conn
            .subscribe(TOPIC_PRESENCE, move |d| forward(&tx, &d, Inbound::Presence))
            .await?;

        info!(user = %self.me, "Chat topics registered");
        Ok(rx)
    }

    pub async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.on_message(message).await,
            Inbound::ReadReceipt(receipt) => {
                if self.store.apply_read_receipt(receipt.message_id) {
                    debug!(id = %receipt.message_id, "Message read by peer");
                    self.events.emit(ClientEvent::MessageRead {
                        id: receipt.message_id,
                    });
                }
            }
            Inbound::Presence(event) => {
                self.presence.apply(event);
                self.events.emit(ClientEvent::PresenceChanged {
                    user: event.user_id,
                    online: event.online,
                });
            }
        }
    }

    async fn on_message(&mut self, message: ChatMessage) {
        let from_me = message.sender.id == self.me;
        let peer = message.peer_of(self.me);
        let id = message.id;

        match self.store.append_incoming(message) {
            AppendOutcome::Duplicate => return,
            AppendOutcome::Confirmed(local) => {
                self.events.emit(ClientEvent::MessageConfirmed { local, id });
            }
            AppendOutcome::Inserted => {}
        }
        self.events.emit(ClientEvent::ConversationChanged { peer });

        if from_me {
            return;
        }
        if self.selected == Some(peer) {
            self.read_in_background().await;
        } else {
            let count = self.store.increment_unread(peer);
            self.events
                .emit(ClientEvent::UnreadChanged { peer, count });
        }
    }

    /// Presence is only trusted while connected.
    pub fn on_connection_status(&mut self, status: ConnectionStatus) {
        if !status.state.is_connected() && self.presence.online_count() > 0 {
            self.presence.clear();
            self.events.emit(ClientEvent::PresenceCleared);
        }
    }

    // -----------------------------------------------------------------------
    // Conversation selection and history
    // -----------------------------------------------------------------------

    /// Make `peer` the active conversation.
    ///
    /// The unread counter drops to zero at once and messages already held are
    /// marked read. Returns the request for the most recent history page;
    /// responses to requests made before this call become stale.
    pub async fn select_peer(&mut self, peer: UserId) -> PageRequest {
        self.selected = Some(peer);
        self.generation += 1;
        self.store.reset_unread(peer);
        self.events
            .emit(ClientEvent::UnreadChanged { peer, count: 0 });
        info!(peer = %peer, "Conversation selected");

        self.read_in_background().await;

        PageRequest {
            peer,
            page: 0,
            size: self.page_size,
            generation: self.generation,
        }
    }

    /// Request for the next older page, if the active conversation has one.
    pub fn load_more(&self) -> Option<PageRequest> {
        let peer = self.selected?;
        let state = self.store.page_state(peer);
        state.has_more.then_some(PageRequest {
            peer,
            page: state.loaded,
            size: self.page_size,
            generation: self.generation,
        })
    }

    pub fn page_state(&self) -> Option<PageState> {
        self.selected.map(|peer| self.store.page_state(peer))
    }

    /// Apply a fetched page, unless it belongs to an earlier selection.
    ///
    /// Fetch errors are returned only for the active conversation.
    pub async fn apply_page(&mut self, response: PageResponse) -> Result<PageOutcome> {
        let request = response.request;
        if request.generation != self.generation || self.selected != Some(request.peer) {
            debug!(peer = %request.peer, page = request.page, "Discarding stale history page");
            return Ok(PageOutcome::Stale);
        }

        let batch = response.result?;
        let outcome = self
            .store
            .merge_page(request.peer, request.page, request.size, batch);
        self.events.emit(ClientEvent::ConversationChanged { peer: request.peer });

        self.read_in_background().await;
        Ok(PageOutcome::Applied(outcome))
    }

    /// Select `peer` and load its first page in one step.
    pub async fn open(&mut self, peer: UserId) -> Result<PageOutcome> {
        let request = self.select_peer(peer).await;
        let response = request.fetch(&self.api).await;
        self.apply_page(response).await
    }

    /// Flip every unread message from the active peer and tell the server.
    ///
    /// The broker receipts are best effort; the REST calls are what persist
    /// the read state. They run concurrently and the first failure is
    /// returned after all ids were attempted. Local flags are not rolled back.
    pub async fn mark_conversation_read(&mut self) -> Result<usize> {
        let ids = self.flip_unread()?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.send_read_receipts(&ids).await;
        persist_read(&self.api, &ids).await?;
        Ok(ids.len())
    }

    /// Like [`mark_conversation_read`](Self::mark_conversation_read), but
    /// the REST calls run on their own task and failures are only logged.
    /// Used from the inbound and paging paths, which must not wait on HTTP.
    async fn read_in_background(&mut self) {
        let ids = match self.flip_unread() {
            Ok(ids) if !ids.is_empty() => ids,
            _ => return,
        };
        self.send_read_receipts(&ids).await;

        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = persist_read(&api, &ids).await {
                warn!(count = ids.len(), error = %e, "Read state not persisted");
            }
        });
    }

    /// Clear the active peer's counter and flip its unread messages locally.
    fn flip_unread(&mut self) -> Result<Vec<MessageId>> {
        let peer = self.selected.ok_or(ClientError::NoPeerSelected)?;
        let ids = self.store.unread_from(peer);
        self.store.reset_unread(peer);
        if !ids.is_empty() {
            self.store.mark_read(&ids);
            debug!(peer = %peer, count = ids.len(), "Conversation marked read");
        }
        Ok(ids)
    }

    async fn send_read_receipts(&self, ids: &[MessageId]) {
        for id in ids {
            self.send_read_receipt(*id).await;
        }
    }

    async fn send_read_receipt(&self, id: MessageId) {
        let receipt = ReadReceipt {
            message_id: id,
            reader_id: Some(self.me),
        };
        if let Err(e) = self.conn.publish_json(DEST_MESSAGE_READ, &receipt).await {
            debug!(id = %id, error = %e, "Read receipt not published");
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send to the active conversation.
    pub async fn send(&mut self, content: &str) -> Result<Message> {
        let peer = self.selected.ok_or(ClientError::NoPeerSelected)?;
        self.send_to(peer, content).await
    }

    /// Show the message at once as pending, then publish it.
    ///
    /// On a publish failure the entry stays visible, marked failed, and the
    /// error is returned.
    pub async fn send_to(&mut self, peer: UserId, content: &str) -> Result<Message> {
        let message = self.store.insert_pending(peer, content, Utc::now())?;
        self.events.emit(ClientEvent::ConversationChanged { peer });

        let Some(local) = message.local_id() else {
            return Ok(message);
        };
        self.publish_pending(&message, local).await?;
        Ok(message)
    }

    /// Publish a failed message again.
    pub async fn retry_failed(&mut self, local: LocalId) -> Result<()> {
        let message = self.store.mark_retrying(local)?;
        self.events.emit(ClientEvent::ConversationChanged {
            peer: message.recipient_id,
        });
        self.publish_pending(&message, local).await
    }

    /// Drop an unconfirmed message from the conversation.
    pub fn discard(&mut self, local: LocalId) -> bool {
        match self.store.discard(local) {
            Some(message) => {
                self.events.emit(ClientEvent::ConversationChanged {
                    peer: message.recipient_id,
                });
                true
            }
            None => false,
        }
    }

    async fn publish_pending(&mut self, message: &Message, local: LocalId) -> Result<()> {
        let payload = SendMessage {
            sender: UserRef::from(self.me),
            recipient: UserRef::from(message.recipient_id),
            content: message.content.clone(),
            read: false,
            client_ref: local,
        };
        match self.conn.publish_json(DEST_SEND_MESSAGE, &payload).await {
            Ok(()) => {
                debug!(local = %local, peer = %message.recipient_id, "Message published");
                Ok(())
            }
            Err(e) => {
                warn!(local = %local, error = %e, "Message publish failed");
                if self.store.mark_failed(local)? {
                    self.events.emit(ClientEvent::MessageFailed {
                        local,
                        error: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Unread counts, users, views
    // -----------------------------------------------------------------------

    /// Seed per-peer unread counters from the server. The active
    /// conversation stays at zero.
    pub async fn load_unread_counts(&mut self) -> Result<u32> {
        let mut counts = self.api.unread_counts().await?;
        if let Some(peer) = self.selected {
            counts.insert(peer, 0);
        }
        self.store.set_unread_counts(counts);
        for (peer, count) in self.store.unread_counts() {
            self.events.emit(ClientEvent::UnreadChanged {
                peer: *peer,
                count: *count,
            });
        }
        Ok(self.store.total_unread())
    }

    pub fn unread_count(&self, peer: UserId) -> u32 {
        self.store.unread_count(peer)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.presence.is_online(user)
    }

    /// Everyone the current user can chat with.
    pub async fn users(&self) -> Result<Vec<UserSummary>> {
        let users = self.api.all_users().await?;
        Ok(self.without_me(users))
    }

    /// Directory search; a blank query lists everyone.
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return self.users().await;
        }
        let users = self.api.search_users(query).await?;
        Ok(self.without_me(users))
    }

    fn without_me(&self, users: Vec<UserSummary>) -> Vec<UserSummary> {
        users.into_iter().filter(|u| u.id != self.me).collect()
    }

    /// The active conversation, oldest first.
    pub fn conversation(&self) -> Vec<&Message> {
        match self.selected {
            Some(peer) => self.store.conversation(peer),
            None => Vec::new(),
        }
    }
}

async fn persist_read<A: ChatApi>(api: &A, ids: &[MessageId]) -> Result<()> {
    let results = join_all(ids.iter().map(|id| api.mark_message_read(*id))).await;
    let mut first_error = None;
    for (id, result) in ids.iter().zip(results) {
        if let Err(e) = result {
            warn!(id = %id, error = %e, "Failed to persist read state");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn forward<T, F>(tx: &mpsc::UnboundedSender<Inbound>, delivery: &Delivery, wrap: F)
where
    T: serde::de::DeserializeOwned,
    F: Fn(T) -> Inbound,
{
    match protocol::decode::<T>(&delivery.body) {
        Ok(payload) => {
            if tx.send(wrap(payload)).is_err() {
                debug!(topic = %delivery.topic, "Session gone, dropping delivery");
            }
        }
        Err(e) => warn!(topic = %delivery.topic, error = %e, "Dropping malformed payload"),
    }
}

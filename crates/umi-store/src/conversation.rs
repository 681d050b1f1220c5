//! Per-peer message history, unread counters and read state.
//!
//! Messages live in a single map keyed by [`MessageKey`]. Optimistic sends
//! are stored under their temporary id until the server copy arrives; the
//! entry is then re-keyed under the server id and the `local -> server`
//! mapping is kept in a side table. REST pages and live deliveries go through
//! the same upsert, so a conversation never holds two entries for one id.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use umi_shared::protocol::ChatMessage;
use umi_shared::{LocalId, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{DeliveryStatus, Message, MessageKey};

/// Clock difference tolerated between the local send time of an optimistic
/// entry and the server timestamp of its copy.
const CONFIRM_SKEW_SECS: i64 = 120;

/// Paging progress for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    /// Number of pages fetched so far (the next page to request).
    pub loaded: u32,
    pub has_more: bool,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            loaded: 0,
            has_more: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Messages from the page that were new to the store.
    pub inserted: usize,
    pub has_more: bool,
}

/// Result of applying one server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Replaced the optimistic entry with this temporary id.
    Confirmed(LocalId),
    /// Already present; only the read flag may have changed.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    me: UserId,
    messages: HashMap<MessageKey, Message>,
    resolved: HashMap<LocalId, MessageId>,
    unread: HashMap<UserId, u32>,
    pages: HashMap<UserId, PageState>,
}

impl ConversationStore {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            messages: HashMap::new(),
            resolved: HashMap::new(),
            unread: HashMap::new(),
            pages: HashMap::new(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // -----------------------------------------------------------------------
    // History and live messages
    // -----------------------------------------------------------------------

    /// Merge one REST history page for `peer`.
    ///
    /// Messages already held (by server id) are not duplicated. A page
    /// shorter than `page_size` ends the history.
    pub fn merge_page(
        &mut self,
        peer: UserId,
        page: u32,
        page_size: u32,
        batch: Vec<ChatMessage>,
    ) -> MergeOutcome {
        let received = batch.len();
        let mut inserted = 0;
        // Only the newest page can hold the server copy of a send still in
        // flight; older pages never confirm by content.
        let by_content = page == 0;
        for wire in batch {
            if wire.peer_of(self.me) != peer {
                warn!(peer = %peer, message = %wire.id, "Ignoring history message for another peer");
                continue;
            }
            if self.upsert(wire, by_content) != AppendOutcome::Duplicate {
                inserted += 1;
            }
        }

        let has_more = page_size > 0 && received as u32 >= page_size;
        let state = self.pages.entry(peer).or_default();
        state.loaded = state.loaded.max(page + 1);
        state.has_more = has_more;

        debug!(peer = %peer, page, received, inserted, has_more, "Merged history page");
        MergeOutcome { inserted, has_more }
    }

    /// Apply a message delivered on the live channel.
    pub fn append_incoming(&mut self, wire: ChatMessage) -> AppendOutcome {
        self.upsert(wire, true)
    }

    fn upsert(&mut self, wire: ChatMessage, by_content: bool) -> AppendOutcome {
        let key = MessageKey::Server(wire.id);
        if let Some(existing) = self.messages.get_mut(&key) {
            existing.read |= wire.read;
            return AppendOutcome::Duplicate;
        }

        let id = wire.id;
        let client_ref = wire.client_ref;
        let message = Message::from(wire);
        let pending = if message.sender_id == self.me {
            self.find_optimistic(client_ref, &message, by_content)
        } else {
            None
        };

        self.messages.insert(key, message);
        match pending {
            Some(local) => {
                self.messages.remove(&MessageKey::Local(local));
                self.resolved.insert(local, id);
                debug!(local = %local, id = %id, "Optimistic message confirmed");
                AppendOutcome::Confirmed(local)
            }
            None => AppendOutcome::Inserted,
        }
    }

    /// Find the optimistic entry a server message confirms.
    ///
    /// An echoed client reference is authoritative. Without one, and only
    /// when `by_content` is set, the oldest pending send with the same
    /// recipient and content is taken, provided the server copy is not older
    /// than the send (within [`CONFIRM_SKEW_SECS`]). Failed sends are never
    /// confirmed by content.
    fn find_optimistic(
        &self,
        client_ref: Option<LocalId>,
        message: &Message,
        by_content: bool,
    ) -> Option<LocalId> {
        if let Some(local) = client_ref {
            return self
                .messages
                .contains_key(&MessageKey::Local(local))
                .then_some(local);
        }
        if !by_content {
            return None;
        }
        self.messages
            .values()
            .filter(|m| {
                m.status == DeliveryStatus::Pending
                    && m.recipient_id == message.recipient_id
                    && m.content == message.content
                    && message.timestamp + Duration::seconds(CONFIRM_SKEW_SECS) >= m.timestamp
            })
            .filter_map(|m| m.local_id().map(|id| (m.timestamp, id)))
            .min()
            .map(|(_, id)| id)
    }

    // -----------------------------------------------------------------------
    // Optimistic sends
    // -----------------------------------------------------------------------

    /// Insert a pending message to `peer` under a fresh temporary id.
    pub fn insert_pending(
        &mut self,
        peer: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let local = LocalId::new();
        let message = Message {
            key: MessageKey::Local(local),
            sender_id: self.me,
            recipient_id: peer,
            content: content.to_string(),
            timestamp: now,
            read: false,
            status: DeliveryStatus::Pending,
        };
        self.messages.insert(message.key, message.clone());
        debug!(local = %local, peer = %peer, "Inserted optimistic message");
        Ok(message)
    }

    /// Flag a pending send as failed. Returns `false` if the server copy
    /// already confirmed it.
    pub fn mark_failed(&mut self, local: LocalId) -> Result<bool> {
        if self.resolved.contains_key(&local) {
            return Ok(false);
        }
        let entry = self
            .messages
            .get_mut(&MessageKey::Local(local))
            .ok_or(StoreError::UnknownMessage(local))?;
        entry.status = DeliveryStatus::Failed;
        Ok(true)
    }

    /// Move a failed send back to pending before it is published again.
    pub fn mark_retrying(&mut self, local: LocalId) -> Result<Message> {
        let entry = self
            .messages
            .get_mut(&MessageKey::Local(local))
            .ok_or(StoreError::UnknownMessage(local))?;
        if entry.status != DeliveryStatus::Failed {
            return Err(StoreError::NotFailed(local));
        }
        entry.status = DeliveryStatus::Pending;
        Ok(entry.clone())
    }

    /// Drop an unconfirmed optimistic entry.
    pub fn discard(&mut self, local: LocalId) -> Option<Message> {
        self.messages.remove(&MessageKey::Local(local))
    }

    /// Server id that replaced a temporary id, if the echo has arrived.
    pub fn resolve(&self, local: LocalId) -> Option<MessageId> {
        self.resolved.get(&local).copied()
    }

    /// Look a message up by temporary id, following the side table once it
    /// has been confirmed.
    pub fn find_local(&self, local: LocalId) -> Option<&Message> {
        match self.resolved.get(&local) {
            Some(id) => self.messages.get(&MessageKey::Server(*id)),
            None => self.messages.get(&MessageKey::Local(local)),
        }
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.messages.get(key)
    }

    // -----------------------------------------------------------------------
    // Read state
    // -----------------------------------------------------------------------

    /// Mark a message read after a receipt. No-op for unknown ids.
    pub fn apply_read_receipt(&mut self, id: MessageId) -> bool {
        match self.messages.get_mut(&MessageKey::Server(id)) {
            Some(message) => {
                let changed = !message.read;
                message.read = true;
                changed
            }
            None => false,
        }
    }

    /// Mark several messages read locally. Returns how many changed.
    pub fn mark_read(&mut self, ids: &[MessageId]) -> usize {
        ids.iter().filter(|id| self.apply_read_receipt(**id)).count()
    }

    /// Unread messages from `peer` addressed to the current user, oldest first.
    pub fn unread_from(&self, peer: UserId) -> Vec<MessageId> {
        let mut unread: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.sender_id == peer && m.recipient_id == self.me && !m.read)
            .collect();
        unread.sort_by(|a, b| ordering(a, b));
        unread.iter().filter_map(|m| m.server_id()).collect()
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// The conversation with `peer`, oldest first.
    pub fn conversation(&self, peer: UserId) -> Vec<&Message> {
        let mut view: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.involves(peer) && m.involves(self.me))
            .collect();
        view.sort_by(|a, b| ordering(a, b));
        view
    }

    /// The `limit` most recent messages with `peer`, newest first.
    pub fn latest(&self, peer: UserId, limit: usize) -> Vec<&Message> {
        let mut view = self.conversation(peer);
        view.reverse();
        view.truncate(limit);
        view
    }

    pub fn page_state(&self, peer: UserId) -> PageState {
        self.pages.get(&peer).copied().unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Unread counters
    // -----------------------------------------------------------------------

    /// Replace all counters with the server's view.
    pub fn set_unread_counts(&mut self, counts: HashMap<UserId, u32>) {
        self.unread = counts;
    }

    pub fn unread_count(&self, peer: UserId) -> u32 {
        self.unread.get(&peer).copied().unwrap_or(0)
    }

    pub fn unread_counts(&self) -> &HashMap<UserId, u32> {
        &self.unread
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    pub fn increment_unread(&mut self, peer: UserId) -> u32 {
        let count = self.unread.entry(peer).or_insert(0);
        *count += 1;
        *count
    }

    pub fn decrement_unread(&mut self, peer: UserId) -> u32 {
        let count = self.unread.entry(peer).or_insert(0);
        *count = count.saturating_sub(1);
        *count
    }

    pub fn reset_unread(&mut self, peer: UserId) {
        self.unread.insert(peer, 0);
    }
}

/// Timestamp order; ties broken by key so rendering is stable.
fn ordering(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use umi_shared::protocol::UserRef;

    const ME: UserId = UserId(1);
    const PEER: UserId = UserId(2);
    const OTHER: UserId = UserId(3);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn wire(id: i64, from: UserId, to: UserId, content: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            sender: UserRef { id: from },
            recipient: UserRef { id: to },
            content: content.to_string(),
            timestamp: at(secs),
            read: false,
            client_ref: None,
        }
    }

    fn ids(view: &[&Message]) -> Vec<MessageKey> {
        view.iter().map(|m| m.key).collect()
    }

    #[test]
    fn test_live_message_interleaves_with_history() {
        let mut store = ConversationStore::new(ME);
        store.merge_page(
            PEER,
            0,
            50,
            vec![wire(1, PEER, ME, "m1", 1), wire(3, ME, PEER, "m3", 3)],
        );
        store.append_incoming(wire(2, PEER, ME, "m2", 2));

        let view = store.conversation(PEER);
        assert_eq!(
            ids(&view),
            vec![
                MessageKey::Server(MessageId(1)),
                MessageKey::Server(MessageId(2)),
                MessageKey::Server(MessageId(3)),
            ]
        );
    }

    #[test]
    fn test_repeated_page_loads_do_not_duplicate() {
        let mut store = ConversationStore::new(ME);
        let page = vec![wire(1, PEER, ME, "a", 1), wire(2, ME, PEER, "b", 2)];
        let first = store.merge_page(PEER, 0, 2, page.clone());
        let second = store.merge_page(PEER, 0, 2, page);

        assert_eq!(first.inserted, 2);
        assert!(first.has_more);
        assert_eq!(second.inserted, 0);
        assert_eq!(store.conversation(PEER).len(), 2);
        assert_eq!(store.page_state(PEER).loaded, 1);
    }

    #[test]
    fn test_short_page_ends_history() {
        let mut store = ConversationStore::new(ME);
        let outcome = store.merge_page(PEER, 0, 50, vec![wire(1, PEER, ME, "a", 1)]);
        assert!(!outcome.has_more);
        assert!(!store.page_state(PEER).has_more);
        assert!(store.page_state(OTHER).has_more);
    }

    #[test]
    fn test_page_for_other_peer_is_filtered() {
        let mut store = ConversationStore::new(ME);
        let outcome = store.merge_page(PEER, 0, 50, vec![wire(9, OTHER, ME, "x", 1)]);
        assert_eq!(outcome.inserted, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_echo_replaces_optimistic_entry() {
        let mut store = ConversationStore::new(ME);
        let pending = store.insert_pending(PEER, "hello", at(5)).unwrap();
        let local = pending.local_id().unwrap();
        assert_eq!(pending.status, DeliveryStatus::Pending);

        let outcome = store.append_incoming(wire(42, ME, PEER, "hello", 6));
        assert_eq!(outcome, AppendOutcome::Confirmed(local));

        let view = store.conversation(PEER);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].key, MessageKey::Server(MessageId(42)));
        assert_eq!(view[0].status, DeliveryStatus::Confirmed);
        assert_eq!(store.resolve(local), Some(MessageId(42)));
        assert_eq!(
            store.find_local(local).map(|m| m.key),
            Some(MessageKey::Server(MessageId(42)))
        );
    }

    #[test]
    fn test_echo_with_client_ref_picks_exact_entry() {
        let mut store = ConversationStore::new(ME);
        let first = store.insert_pending(PEER, "same", at(1)).unwrap();
        let second = store.insert_pending(PEER, "same", at(2)).unwrap();
        let second_local = second.local_id().unwrap();

        let mut echo = wire(10, ME, PEER, "same", 3);
        echo.client_ref = Some(second_local);
        assert_eq!(
            store.append_incoming(echo),
            AppendOutcome::Confirmed(second_local)
        );
        assert!(store.get(&first.key).is_some());
        assert!(store.get(&second.key).is_none());
    }

    #[test]
    fn test_echo_without_ref_confirms_oldest_match() {
        let mut store = ConversationStore::new(ME);
        let first = store.insert_pending(PEER, "same", at(1)).unwrap();
        let _second = store.insert_pending(PEER, "same", at(2)).unwrap();

        assert_eq!(
            store.append_incoming(wire(10, ME, PEER, "same", 3)),
            AppendOutcome::Confirmed(first.local_id().unwrap())
        );
        assert_eq!(store.conversation(PEER).len(), 2);
    }

    #[test]
    fn test_echo_in_history_page_confirms_pending() {
        let mut store = ConversationStore::new(ME);
        store.insert_pending(PEER, "hi", at(1)).unwrap();
        store.merge_page(PEER, 0, 50, vec![wire(7, ME, PEER, "hi", 1)]);
        let view = store.conversation(PEER);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].key, MessageKey::Server(MessageId(7)));
    }

    #[test]
    fn test_older_history_page_does_not_confirm_failed_send() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "ok", at(100))
            .unwrap()
            .local_id()
            .unwrap();
        store.mark_failed(local).unwrap();

        let outcome = store.merge_page(PEER, 1, 50, vec![wire(3, ME, PEER, "ok", -100_000_000)]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.resolve(local), None);
        assert_eq!(
            store.find_local(local).map(|m| m.status),
            Some(DeliveryStatus::Failed)
        );
        assert_eq!(store.conversation(PEER).len(), 2);
    }

    #[test]
    fn test_older_history_page_does_not_confirm_pending_send() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "ok", at(100))
            .unwrap()
            .local_id()
            .unwrap();

        store.merge_page(PEER, 1, 50, vec![wire(3, ME, PEER, "ok", 99)]);
        assert_eq!(store.resolve(local), None);
        assert_eq!(
            store.find_local(local).map(|m| m.status),
            Some(DeliveryStatus::Pending)
        );
    }

    #[test]
    fn test_old_message_on_first_page_does_not_confirm_newer_send() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "ok", at(1_000))
            .unwrap()
            .local_id()
            .unwrap();

        store.merge_page(PEER, 0, 50, vec![wire(3, ME, PEER, "ok", 10)]);
        assert_eq!(store.resolve(local), None);
        assert_eq!(store.conversation(PEER).len(), 2);

        // A server clock slightly behind ours still confirms.
        assert_eq!(
            store.append_incoming(wire(4, ME, PEER, "ok", 1_000 - 30)),
            AppendOutcome::Confirmed(local)
        );
    }

    #[test]
    fn test_live_echo_does_not_confirm_failed_send() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "ok", at(5))
            .unwrap()
            .local_id()
            .unwrap();
        store.mark_failed(local).unwrap();

        assert_eq!(
            store.append_incoming(wire(8, ME, PEER, "ok", 6)),
            AppendOutcome::Inserted
        );
        assert_eq!(
            store.find_local(local).map(|m| m.status),
            Some(DeliveryStatus::Failed)
        );
    }

    #[test]
    fn test_unknown_client_ref_does_not_fall_back_to_content() {
        let mut store = ConversationStore::new(ME);
        let pending = store.insert_pending(PEER, "ok", at(5)).unwrap();

        let mut echo = wire(8, ME, PEER, "ok", 6);
        echo.client_ref = Some(LocalId::new());
        assert_eq!(store.append_incoming(echo), AppendOutcome::Inserted);
        assert!(store.get(&pending.key).is_some());
    }

    #[test]
    fn test_empty_content_is_rejected() {
        let mut store = ConversationStore::new(ME);
        assert_eq!(
            store.insert_pending(PEER, "   ", at(0)),
            Err(StoreError::EmptyContent)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_send_can_be_retried_or_discarded() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "oops", at(0))
            .unwrap()
            .local_id()
            .unwrap();

        assert_eq!(
            store.mark_retrying(local),
            Err(StoreError::NotFailed(local))
        );
        assert_eq!(store.mark_failed(local), Ok(true));
        assert_eq!(
            store.find_local(local).map(|m| m.status),
            Some(DeliveryStatus::Failed)
        );

        let retried = store.mark_retrying(local).unwrap();
        assert_eq!(retried.status, DeliveryStatus::Pending);

        store.mark_failed(local).unwrap();
        assert!(store.discard(local).is_some());
        assert!(store.conversation(PEER).is_empty());
        assert_eq!(
            store.mark_failed(local),
            Err(StoreError::UnknownMessage(local))
        );
    }

    #[test]
    fn test_mark_failed_after_confirmation_is_noop() {
        let mut store = ConversationStore::new(ME);
        let local = store
            .insert_pending(PEER, "fast", at(0))
            .unwrap()
            .local_id()
            .unwrap();
        store.append_incoming(wire(5, ME, PEER, "fast", 0));
        assert_eq!(store.mark_failed(local), Ok(false));
    }

    #[test]
    fn test_read_receipts() {
        let mut store = ConversationStore::new(ME);
        store.append_incoming(wire(1, ME, PEER, "a", 1));
        assert!(store.apply_read_receipt(MessageId(1)));
        assert!(!store.apply_read_receipt(MessageId(1)));
        assert!(!store.apply_read_receipt(MessageId(99)));
        assert!(store.conversation(PEER)[0].read);
    }

    #[test]
    fn test_duplicate_delivery_keeps_read_flag() {
        let mut store = ConversationStore::new(ME);
        let mut read = wire(1, PEER, ME, "a", 1);
        read.read = true;
        store.append_incoming(read);
        assert_eq!(
            store.append_incoming(wire(1, PEER, ME, "a", 1)),
            AppendOutcome::Duplicate
        );
        assert!(store.conversation(PEER)[0].read);
    }

    #[test]
    fn test_unread_from_peer() {
        let mut store = ConversationStore::new(ME);
        store.merge_page(
            PEER,
            0,
            50,
            vec![
                wire(3, PEER, ME, "c", 3),
                wire(1, PEER, ME, "a", 1),
                wire(2, ME, PEER, "b", 2),
            ],
        );
        assert_eq!(store.unread_from(PEER), vec![MessageId(1), MessageId(3)]);

        assert_eq!(store.mark_read(&[MessageId(1), MessageId(3)]), 2);
        assert!(store.unread_from(PEER).is_empty());
    }

    #[test]
    fn test_unread_counters() {
        let mut store = ConversationStore::new(ME);
        store.set_unread_counts(HashMap::from([(PEER, 3), (OTHER, 1)]));
        assert_eq!(store.total_unread(), 4);

        store.reset_unread(PEER);
        assert_eq!(store.unread_count(PEER), 0);
        assert_eq!(store.decrement_unread(PEER), 0);
        assert_eq!(store.increment_unread(OTHER), 2);
        assert_eq!(store.unread_count(UserId(99)), 0);
    }

    #[test]
    fn test_latest_is_newest_first() {
        let mut store = ConversationStore::new(ME);
        for i in 1..=5 {
            store.append_incoming(wire(i, PEER, ME, "x", i));
        }
        let latest = store.latest(PEER, 2);
        assert_eq!(
            ids(&latest),
            vec![
                MessageKey::Server(MessageId(5)),
                MessageKey::Server(MessageId(4)),
            ]
        );
    }
}

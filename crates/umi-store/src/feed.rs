//! Notification list and unread counter.
//!
//! The list is newest first. The unread counter follows the server whenever
//! the server reports one; local edits adjust it in between.

use tracing::debug;

use umi_shared::NotificationId;

use crate::models::{Notification, NotificationUpdate};

#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    unread: u32,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list after an initial load. Without a server count the
    /// counter is recomputed from the items.
    pub fn replace(&mut self, mut items: Vec<Notification>, server_count: Option<u32>) {
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let local = items.iter().filter(|n| !n.read).count() as u32;
        self.unread = server_count.unwrap_or(local);
        self.items = items;
        debug!(items = self.items.len(), unread = self.unread, "Notification feed loaded");
    }

    /// Apply a pushed update. The notification is prepended if new; the
    /// counter always takes the server's value. Returns whether the list
    /// changed.
    pub fn on_push(&mut self, update: NotificationUpdate) -> bool {
        self.unread = update.unread_count;
        let id = update.notification.id;
        if self.items.iter().any(|n| n.id == id) {
            debug!(id = %id, "Duplicate notification push");
            return false;
        }
        self.items.insert(0, update.notification);
        true
    }

    /// Mark one notification read. Returns `false` if it was unknown or
    /// already read.
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.read => {
                n.read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Mark everything read. Returns how many items changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for n in self.items.iter_mut().filter(|n| !n.read) {
            n.read = true;
            changed += 1;
        }
        self.unread = 0;
        changed
    }

    pub fn set_unread_count(&mut self, count: u32) {
        self.unread = count;
    }

    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn notification(id: i64, read: bool) -> Notification {
        Notification {
            id: NotificationId(id),
            message: format!("n{id}"),
            sender_img_url: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            read,
        }
    }

    #[test]
    fn test_replace_sorts_newest_first() {
        let mut feed = NotificationFeed::new();
        feed.replace(
            vec![notification(1, false), notification(3, true), notification(2, false)],
            None,
        );
        let ids: Vec<_> = feed.items().iter().map(|n| n.id).collect();
        assert_eq!(
            ids,
            vec![NotificationId(3), NotificationId(2), NotificationId(1)]
        );
        assert_eq!(feed.unread_count(), 2);
    }

    #[test]
    fn test_server_count_wins_on_load() {
        let mut feed = NotificationFeed::new();
        feed.replace(vec![notification(1, false)], Some(9));
        assert_eq!(feed.unread_count(), 9);
    }

    #[test]
    fn test_push_prepends_and_takes_server_count() {
        let mut feed = NotificationFeed::new();
        feed.replace(vec![notification(1, false)], Some(1));

        assert!(feed.on_push(NotificationUpdate {
            notification: notification(2, false),
            unread_count: 4,
        }));
        assert_eq!(feed.items()[0].id, NotificationId(2));
        assert_eq!(feed.unread_count(), 4);

        assert!(!feed.on_push(NotificationUpdate {
            notification: notification(2, false),
            unread_count: 2,
        }));
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.unread_count(), 2);
    }

    #[test]
    fn test_mark_read_decrements_once() {
        let mut feed = NotificationFeed::new();
        feed.replace(vec![notification(1, false), notification(2, false)], None);

        assert!(feed.mark_read(NotificationId(1)));
        assert!(!feed.mark_read(NotificationId(1)));
        assert!(!feed.mark_read(NotificationId(42)));
        assert_eq!(feed.unread_count(), 1);
        assert!(feed.get(NotificationId(1)).unwrap().read);
    }

    #[test]
    fn test_counter_never_goes_negative() {
        let mut feed = NotificationFeed::new();
        feed.replace(vec![notification(1, false)], Some(0));
        assert!(feed.mark_read(NotificationId(1)));
        assert_eq!(feed.unread_count(), 0);
    }

    #[test]
    fn test_mark_all_read() {
        let mut feed = NotificationFeed::new();
        feed.replace((1..=5).map(|i| notification(i, false)).collect(), None);
        assert_eq!(feed.unread_count(), 5);

        assert_eq!(feed.mark_all_read(), 5);
        assert_eq!(feed.unread_count(), 0);
        assert!(feed.items().iter().all(|n| n.read));
    }
}

//! Online-user tracking.
//!
//! Maintains the set of users currently reported online by presence events.
//! Nothing is persisted; the set is cleared whenever the broker connection
//! goes away, since presence can no longer be trusted.

use std::collections::HashSet;

use tracing::debug;

use umi_shared::protocol::PresenceEvent;
use umi_shared::UserId;

/// Tracks which users are online.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    /// Create a new, empty tracker.
    pub fn new() -> Self {
        Self {
            online: HashSet::new(),
        }
    }

    pub fn mark_online(&mut self, user: UserId) {
        if self.online.insert(user) {
            debug!(user = %user, "User came online");
        }
    }

    pub fn mark_offline(&mut self, user: UserId) {
        if self.online.remove(&user) {
            debug!(user = %user, "User went offline");
        }
    }

    /// Apply a presence event from the broker.
    pub fn apply(&mut self, event: PresenceEvent) {
        if event.online {
            self.mark_online(event.user_id);
        } else {
            self.mark_offline(event.user_id);
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains(&user)
    }

    /// Snapshot of online users, sorted by id.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().copied().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forget everyone, e.g. on connection teardown.
    pub fn clear(&mut self) {
        if !self.online.is_empty() {
            debug!(count = self.online.len(), "Clearing presence");
        }
        self.online.clear();
    }
}

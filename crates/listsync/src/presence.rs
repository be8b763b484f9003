/// User presence tracking for shared lists
/// Shows who is viewing a list and who is typing. Best effort only.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ListId, UserId};

/// Default liveness timeout
pub const PRESENCE_TIMEOUT_SECS: i64 = 30;

/// One user's presence on one list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub list_id: ListId,
    pub user_id: UserId,
    /// When the user became present
    pub joined_at: chrono::DateTime<chrono::Utc>,

    /// Last activity; drives expiry
    pub last_seen: chrono::DateTime<chrono::Utc>,

    /// Typing indicator
    pub typing: bool,
}

/// Presence change broadcast to a list's sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Joined { user_id: UserId },
    Left { user_id: UserId },
    Typing { user_id: UserId, typing: bool },
}

/// Tracks (list, user) pairs with a liveness timeout
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    entries: HashMap<(ListId, UserId), PresenceEntry>,
    timeout: chrono::Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(PRESENCE_TIMEOUT_SECS))
    }
}

impl PresenceTracker {
    /// Create a tracker evicting users idle longer than `timeout`
    pub fn new(timeout: chrono::Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Refresh liveness. Returns true when the user was not present before.
    pub fn touch(&mut self, list: ListId, user: UserId, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.entries.get_mut(&(list, user)) {
            Some(entry) => {
                entry.last_seen = now;
                false
            }
            None => {
                self.entries.insert(
                    (list, user),
                    PresenceEntry {
                        list_id: list,
                        user_id: user,
                        joined_at: now,
                        last_seen: now,
                        typing: false,
                    },
                );
                true
            }
        }
    }

    /// Touch and record the typing indicator. Returns true when newly joined.
    pub fn set_typing(
        &mut self,
        list: ListId,
        user: UserId,
        typing: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        let joined = self.touch(list, user, now);
        if let Some(entry) = self.entries.get_mut(&(list, user)) {
            entry.typing = typing;
        }
        joined
    }

    /// Remove a user. Returns true if they were present.
    pub fn leave(&mut self, list: ListId, user: UserId) -> bool {
        self.entries.remove(&(list, user)).is_some()
    }

    /// Remove entries not seen within the timeout
    pub fn evict_expired(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<(ListId, UserId)> {
        let timeout = self.timeout;
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.last_seen > timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Get a user's presence entry
    pub fn get(&self, list: ListId, user: UserId) -> Option<&PresenceEntry> {
        self.entries.get(&(list, user))
    }

    /// Check if a user is present on a list
    pub fn is_present(&self, list: ListId, user: UserId) -> bool {
        self.entries.contains_key(&(list, user))
    }

    /// Users present on `list`, sorted
    pub fn members(&self, list: ListId) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .entries
            .keys()
            .filter(|(l, _)| *l == list)
            .map(|(_, u)| *u)
            .collect();
        users.sort();
        users
    }
}

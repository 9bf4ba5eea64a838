use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    time::Duration,
};

use shared::domain::{PresenceEntry, UserId, UserSummary};
use tokio::time::Instant;

pub const TYPING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct PresenceAggregator {
    directory: Vec<UserSummary>,
    online: Vec<UserSummary>,
    online_ids: HashSet<UserId>,
    typing: HashMap<String, Instant>,
    typing_timeout: Duration,
}

impl Default for PresenceAggregator {
    fn default() -> Self {
        Self::new(TYPING_TIMEOUT)
    }
}

impl PresenceAggregator {
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            directory: Vec::new(),
            online: Vec::new(),
            online_ids: HashSet::new(),
            typing: HashMap::new(),
            typing_timeout,
        }
    }

    pub fn set_directory(&mut self, users: Vec<UserSummary>) {
        self.directory = dedup_by_id(users);
    }

    pub fn directory(&self) -> &[UserSummary] {
        &self.directory
    }

    pub fn replace_online(&mut self, users: Vec<UserSummary>) {
        self.online = dedup_by_id(users);
        self.online_ids = self.online.iter().map(|u| u.id.clone()).collect();
    }

    pub fn clear_online(&mut self) {
        self.online.clear();
        self.online_ids.clear();
    }

    pub fn online_users(&self) -> &[UserSummary] {
        &self.online
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online_ids.contains(user_id)
    }

    pub fn members(&self) -> Vec<PresenceEntry> {
        let mut members: Vec<PresenceEntry> = self
            .directory
            .iter()
            .map(|user| PresenceEntry::from_user(user, self.is_online(&user.id)))
            .collect();
        members.sort_by(member_order);
        members
    }

    /// Records a typing event. Returns whether the visible set changed.
    pub fn set_typing(&mut self, username: &str, is_typing: bool, now: Instant) -> bool {
        if username.is_empty() {
            return false;
        }
        let changed = self.prune_typing(now);
        if is_typing {
            let deadline = now + self.typing_timeout;
            self.typing.insert(username.to_string(), deadline).is_none() || changed
        } else {
            self.typing.remove(username).is_some() || changed
        }
    }

    pub fn prune_typing(&mut self, now: Instant) -> bool {
        let before = self.typing.len();
        self.typing.retain(|_, deadline| *deadline > now);
        before != self.typing.len()
    }

    pub fn clear_typing(&mut self) -> bool {
        let changed = !self.typing.is_empty();
        self.typing.clear();
        changed
    }

    pub fn typing_users(&self, now: Instant) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(username, _)| username.clone())
            .collect();
        users.sort();
        users
    }

    pub fn typing_deadline(&self, username: &str) -> Option<Instant> {
        self.typing.get(username).copied()
    }
}

pub fn member_order(a: &PresenceEntry, b: &PresenceEntry) -> Ordering {
    b.is_online
        .cmp(&a.is_online)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

fn dedup_by_id(users: Vec<UserSummary>) -> Vec<UserSummary> {
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|user| seen.insert(user.id.clone()))
        .collect()
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

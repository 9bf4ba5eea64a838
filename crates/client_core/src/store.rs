use std::collections::HashSet;

use shared::domain::{ChatMessage, MessageId};

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, messages: Vec<ChatMessage>) {
        self.messages.clear();
        self.ids.clear();
        for message in messages {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
    }

    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    // Keeps the position of `id`. A new id that already exists elsewhere drops
    // the entry under `id` instead.
    pub fn replace(&mut self, id: &MessageId, message: ChatMessage) -> bool {
        let Some(position) = self.position(id) else {
            return false;
        };

        if &message.id != id {
            if self.ids.contains(&message.id) {
                self.messages.remove(position);
                self.ids.remove(id);
                return true;
            }
            self.ids.remove(id);
            self.ids.insert(message.id.clone());
        }
        self.messages[position] = message;
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        let Some(position) = self.position(id) else {
            return false;
        };
        self.messages.remove(position);
        self.ids.remove(id);
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.position(id).map(|position| &self.messages[position])
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| &m.id == id)
    }
}

/// Fresh records win for overlapping ids. Local-only records older than the
/// window go before it, everything else local-only (cached or received live
/// while the fetch was in flight) goes after it, each group in local order.
pub fn merge_history(fresh: Vec<ChatMessage>, local: &[ChatMessage]) -> Vec<ChatMessage> {
    let fresh_ids: HashSet<&MessageId> = fresh.iter().map(|m| &m.id).collect();
    let window_start = fresh.iter().map(|m| m.created_at).min();

    let mut before = Vec::new();
    let mut after = Vec::new();
    for message in local.iter().filter(|m| !fresh_ids.contains(&m.id)) {
        match window_start {
            Some(start) if message.created_at < start => before.push(message.clone()),
            _ => after.push(message.clone()),
        }
    }

    let mut merged = before;
    merged.extend(fresh);
    merged.extend(after);
    merged
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

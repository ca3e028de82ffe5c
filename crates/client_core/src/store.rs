use std::collections::{BTreeMap, HashMap, HashSet};

use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    protocol::{ChatMessage, Reaction, ReactionAction},
};

/// Whether the persisted store has acknowledged a local message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Pending,
    Confirmed,
    Failed,
}

/// Who set the current status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOrigin {
    Local,
    Optimistic,
    Receipt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub message: ChatMessage,
    pub persistence: Persistence,
    pub status_origin: StatusOrigin,
    seq: u64,
}

impl LocalMessage {
    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn status(&self) -> Option<MessageStatus> {
        self.message.status
    }

    /// Insertion order across the whole store.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Existing,
}

/// In-memory view of every open conversation. No I/O happens here; the
/// engine persists and publishes around these calls.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ConversationId, Vec<LocalMessage>>,
    unread: HashMap<ConversationId, u32>,
    typing: HashMap<ConversationId, BTreeMap<UserId, String>>,
    next_seq: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` unless its id is already present in `key`.
    pub fn upsert_message(
        &mut self,
        key: &ConversationId,
        message: ChatMessage,
        persistence: Persistence,
    ) -> Upsert {
        let seq = self.next_seq;
        let messages = self.conversations.entry(key.clone()).or_default();
        if messages.iter().any(|local| local.message.id == message.id) {
            return Upsert::Existing;
        }
        messages.push(LocalMessage {
            message,
            persistence,
            status_origin: StatusOrigin::Local,
            seq,
        });
        self.next_seq += 1;
        Upsert::Inserted
    }

    /// Folds messages read back from the persisted store into `key`.
    /// Known ids only have their status advanced; the rest are appended.
    /// Returns the ids that were new.
    pub fn merge_messages(
        &mut self,
        key: &ConversationId,
        loaded: Vec<ChatMessage>,
    ) -> Vec<MessageId> {
        let mut inserted = Vec::new();
        for message in loaded {
            if let Some(local) = self.find_mut(key, &message.id) {
                if let Some(status) = message.status {
                    if status.advances(local.message.status) {
                        local.message.status = Some(status);
                    }
                }
                local.persistence = Persistence::Confirmed;
                continue;
            }
            let id = message.id.clone();
            self.upsert_message(key, message, Persistence::Confirmed);
            inserted.push(id);
        }
        inserted
    }

    /// Current insertion watermark. A history load captures it before it
    /// starts so [`Self::replace_history`] can keep anything newer.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Replaces `key` with a freshly loaded history. Entries inserted at or
    /// after `watermark`, and entries the store has not confirmed, are
    /// carried over when the load does not contain them. Status never
    /// moves backwards across the swap.
    pub fn replace_history(
        &mut self,
        key: &ConversationId,
        loaded: Vec<ChatMessage>,
        watermark: u64,
    ) {
        let previous = self.conversations.remove(key).unwrap_or_default();
        let loaded_ids: HashSet<MessageId> = loaded.iter().map(|m| m.id.clone()).collect();
        let mut by_id: HashMap<MessageId, LocalMessage> = previous
            .iter()
            .map(|local| (local.message.id.clone(), local.clone()))
            .collect();

        let mut rebuilt = Vec::with_capacity(loaded.len());
        for mut message in loaded {
            let seq = self.next_seq;
            self.next_seq += 1;
            let mut status_origin = StatusOrigin::Local;
            if let Some(prior) = by_id.remove(&message.id) {
                if let Some(status) = prior.message.status {
                    if status.advances(message.status) {
                        message.status = Some(status);
                        status_origin = prior.status_origin;
                    }
                }
                if message.reactions.is_empty() {
                    message.reactions = prior.message.reactions;
                }
            }
            rebuilt.push(LocalMessage {
                message,
                persistence: Persistence::Confirmed,
                status_origin,
                seq,
            });
        }

        for local in previous {
            if loaded_ids.contains(&local.message.id) {
                continue;
            }
            if local.seq >= watermark || local.persistence != Persistence::Confirmed {
                rebuilt.push(local);
            }
        }

        self.conversations.insert(key.clone(), rebuilt);
    }

    /// Advances a message status. Equal status from a receipt only
    /// retags an optimistic value. Returns true when the status changed.
    pub fn patch_message_status(
        &mut self,
        key: &ConversationId,
        id: &MessageId,
        status: MessageStatus,
        origin: StatusOrigin,
    ) -> bool {
        let Some(local) = self.find_mut(key, id) else {
            return false;
        };
        apply_status(local, status, origin)
    }

    /// Applies a receipt to messages authored by `author` in `key`.
    /// `ids = None` covers all of them. Returns the ids that advanced.
    pub fn apply_receipt(
        &mut self,
        key: &ConversationId,
        author: &UserId,
        ids: Option<&[MessageId]>,
        status: MessageStatus,
    ) -> Vec<MessageId> {
        let Some(messages) = self.conversations.get_mut(key) else {
            return Vec::new();
        };
        messages
            .iter_mut()
            .filter(|local| &local.message.sender_id == author)
            .filter(|local| ids.map_or(true, |ids| ids.contains(&local.message.id)))
            .filter_map(|local| {
                apply_status(local, status, StatusOrigin::Receipt).then(|| local.message.id.clone())
            })
            .collect()
    }

    /// Set semantics keyed by `(emoji, user)`. Returns true when the
    /// reaction list changed.
    pub fn patch_reactions(
        &mut self,
        key: &ConversationId,
        id: &MessageId,
        reaction: Reaction,
        action: ReactionAction,
    ) -> bool {
        let Some(local) = self.find_mut(key, id) else {
            return false;
        };
        let reactions = &mut local.message.reactions;
        let present = reactions.contains(&reaction);
        match action {
            ReactionAction::Add if !present => {
                reactions.push(reaction);
                true
            }
            ReactionAction::Remove if present => {
                reactions.retain(|existing| existing != &reaction);
                true
            }
            _ => false,
        }
    }

    pub fn set_persistence(&mut self, key: &ConversationId, id: &MessageId, persistence: Persistence) {
        if let Some(local) = self.find_mut(key, id) {
            local.persistence = persistence;
        }
    }

    /// Drops a message that was never persisted. Saved messages stay.
    pub fn discard_unconfirmed(&mut self, key: &ConversationId, id: &MessageId) -> bool {
        let Some(messages) = self.conversations.get_mut(key) else {
            return false;
        };
        let before = messages.len();
        messages.retain(|local| {
            &local.message.id != id || local.persistence == Persistence::Confirmed
        });
        messages.len() != before
    }

    pub fn replace_text(&mut self, key: &ConversationId, id: &MessageId, text: String) {
        if let Some(local) = self.find_mut(key, id) {
            local.message.text = text;
        }
    }

    /// `name = None` clears the entry. The conversation key disappears
    /// once nobody is typing.
    pub fn set_typing(&mut self, key: &ConversationId, user_id: &UserId, name: Option<String>) {
        match name {
            Some(name) => {
                self.typing
                    .entry(key.clone())
                    .or_default()
                    .insert(user_id.clone(), name);
            }
            None => {
                if let Some(typing) = self.typing.get_mut(key) {
                    typing.remove(user_id);
                    if typing.is_empty() {
                        self.typing.remove(key);
                    }
                }
            }
        }
    }

    pub fn typing(&self, key: &ConversationId) -> Option<&BTreeMap<UserId, String>> {
        self.typing.get(key)
    }

    pub fn increment_unread(&mut self, key: &ConversationId) -> u32 {
        let count = self.unread.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Adds `count` to the existing counter; never lowers it.
    pub fn add_unread(&mut self, key: &ConversationId, count: u32) -> u32 {
        if count == 0 {
            return self.unread(key);
        }
        let total = self.unread.entry(key.clone()).or_insert(0);
        *total = total.saturating_add(count);
        *total
    }

    pub fn clear_unread(&mut self, key: &ConversationId) {
        self.unread.remove(key);
    }

    pub fn unread(&self, key: &ConversationId) -> u32 {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn unread_counts(&self) -> HashMap<ConversationId, u32> {
        self.unread.clone()
    }

    pub fn messages(&self, key: &ConversationId) -> &[LocalMessage] {
        self.conversations
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find(&self, key: &ConversationId, id: &MessageId) -> Option<&LocalMessage> {
        self.messages(key).iter().find(|local| &local.message.id == id)
    }

    /// Messages of `key` ordered by timestamp for rendering.
    pub fn snapshot(&self, key: &ConversationId) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .messages(key)
            .iter()
            .map(|local| local.message.clone())
            .collect();
        messages.sort_by_key(|message| message.timestamp);
        messages
    }

    /// Incoming messages in `key` the local user has not read yet.
    pub fn unread_incoming(&self, key: &ConversationId, me: &UserId) -> Vec<MessageId> {
        self.messages(key)
            .iter()
            .filter(|local| &local.message.sender_id != me)
            .filter(|local| MessageStatus::Read.advances(local.message.status))
            .map(|local| local.message.id.clone())
            .collect()
    }

    /// Saved messages authored by `me` that are still waiting for a connection.
    pub fn queued_outgoing(&self, me: &UserId) -> Vec<(ConversationId, MessageId)> {
        let mut queued = Vec::new();
        for (key, messages) in &self.conversations {
            for local in messages {
                if &local.message.sender_id == me
                    && local.persistence == Persistence::Confirmed
                    && local.message.status == Some(MessageStatus::Queued)
                {
                    queued.push((key.clone(), local.message.id.clone()));
                }
            }
        }
        queued
    }

    fn find_mut(&mut self, key: &ConversationId, id: &MessageId) -> Option<&mut LocalMessage> {
        self.conversations
            .get_mut(key)?
            .iter_mut()
            .find(|local| &local.message.id == id)
    }
}

fn apply_status(local: &mut LocalMessage, status: MessageStatus, origin: StatusOrigin) -> bool {
    if status.advances(local.message.status) {
        local.message.status = Some(status);
        local.status_origin = origin;
        return true;
    }
    if local.message.status == Some(status)
        && local.status_origin == StatusOrigin::Optimistic
        && origin == StatusOrigin::Receipt
    {
        local.status_origin = StatusOrigin::Receipt;
    }
    false
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

use std::collections::BTreeMap;

use shared::domain::{Conversation, ConversationId, UserId};

pub const CHAT_NAMESPACE: &str = "chat";
pub const USER_NAMESPACE: &str = "user";
const PAIR_DELIMITER: char = '-';

/// Topic shared by both peers of a direct chat. The pair is sorted so
/// either side derives the same string without a handshake.
pub fn direct_topic(a: &UserId, b: &UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{CHAT_NAMESPACE}/{low}{PAIR_DELIMITER}{high}")
}

pub fn group_topic(group_id: &ConversationId) -> String {
    format!("{CHAT_NAMESPACE}/{group_id}")
}

/// Personal inbox for invitations and friend notices.
pub fn inbox_topic(user_id: &UserId) -> String {
    format!("{USER_NAMESPACE}/{user_id}")
}

/// Retained presence topic.
pub fn status_topic(user_id: &UserId) -> String {
    format!("{USER_NAMESPACE}/{user_id}/status")
}

pub fn topic_for(me: &UserId, conversation: &Conversation) -> String {
    match conversation {
        Conversation::Direct { peer } => direct_topic(me, peer),
        Conversation::Group { group_id } => group_topic(group_id),
    }
}

/// Resolves topics for one signed-in user and remembers which
/// conversations already have a subscription requested.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    me: UserId,
    tracked: BTreeMap<ConversationId, String>,
}

impl TopicRouter {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            tracked: BTreeMap::new(),
        }
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn topic_for(&self, conversation: &Conversation) -> String {
        topic_for(&self.me, conversation)
    }

    pub fn inbox(&self) -> String {
        inbox_topic(&self.me)
    }

    pub fn status(&self) -> String {
        status_topic(&self.me)
    }

    /// Records the conversation and returns its topic when it was not
    /// tracked before.
    pub fn track(&mut self, conversation: &Conversation) -> Option<String> {
        let key = conversation.key();
        if self.tracked.contains_key(&key) {
            return None;
        }
        let topic = self.topic_for(conversation);
        self.tracked.insert(key, topic.clone());
        Some(topic)
    }

    pub fn is_tracked(&self, key: &ConversationId) -> bool {
        self.tracked.contains_key(key)
    }

    pub fn topics(&self) -> Vec<String> {
        self.tracked.values().cloned().collect()
    }
}

#[cfg(test)]
#[path = "tests/topics_tests.rs"]
mod tests;

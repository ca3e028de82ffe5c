use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use shared::domain::{Contact, ConversationId, PresenceState};

/// Known contacts for the signed-in user. AI personas are always present
/// and survive a refresh from the persisted store.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    personas: BTreeMap<ConversationId, Contact>,
    contacts: BTreeMap<ConversationId, Contact>,
}

impl ContactDirectory {
    pub fn new(personas: Vec<Contact>) -> Self {
        Self {
            personas: personas
                .into_iter()
                .map(|persona| (persona.id.clone(), persona))
                .collect(),
            contacts: BTreeMap::new(),
        }
    }

    pub fn replace_all(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts
            .into_iter()
            .filter(|contact| !self.personas.contains_key(&contact.id))
            .map(|contact| (contact.id.clone(), contact))
            .collect();
    }

    /// Returns false when the contact was already known.
    pub fn insert(&mut self, contact: Contact) -> bool {
        if self.is_known(&contact.id) {
            return false;
        }
        self.contacts.insert(contact.id.clone(), contact);
        true
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Contact> {
        self.contacts.get(id).or_else(|| self.personas.get(id))
    }

    pub fn is_known(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_ai(&self, id: &ConversationId) -> bool {
        self.get(id).is_some_and(|contact| contact.is_ai)
    }

    pub fn is_group(&self, id: &ConversationId) -> bool {
        self.get(id).is_some_and(|contact| contact.is_group)
    }

    /// Personas that are members of `group` and mentioned as `@Name`.
    pub fn mentioned_personas(&self, group: &ConversationId, text: &str) -> Vec<Contact> {
        let Some(group) = self.contacts.get(group) else {
            return Vec::new();
        };
        self.personas
            .values()
            .filter(|persona| {
                group
                    .member_ids
                    .iter()
                    .any(|member| member.as_str() == persona.id.as_str())
            })
            .filter(|persona| text.contains(&mention_tag(persona)))
            .cloned()
            .collect()
    }

    /// Records activity from a non-AI contact. Returns true when its
    /// presence flipped to online.
    pub fn mark_online(&mut self, id: &ConversationId, at: DateTime<Utc>) -> bool {
        let Some(contact) = self.contacts.get_mut(id) else {
            return false;
        };
        if contact.is_group {
            return false;
        }
        let changed = contact.status != PresenceState::Online;
        contact.status = PresenceState::Online;
        contact.last_seen = Some(at);
        changed
    }

    pub fn set_presence(&mut self, id: &ConversationId, status: PresenceState, at: DateTime<Utc>) {
        if let Some(contact) = self.contacts.get_mut(id) {
            contact.status = status;
            contact.last_seen = Some(at);
        }
    }

    pub fn list(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts.values().cloned().collect();
        contacts.sort_by_key(|contact| !contact.is_pinned);
        contacts.extend(self.personas.values().cloned());
        contacts
    }
}

pub fn mention_tag(persona: &Contact) -> String {
    format!("@{}", persona.name)
}

#[cfg(test)]
#[path = "tests/contacts_tests.rs"]
mod tests;

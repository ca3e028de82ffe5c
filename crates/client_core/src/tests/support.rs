use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use shared::{
    domain::{Contact, Conversation, ConversationId, LocalUser, MessageId, MessageStatus, PresenceState, UserId},
    protocol::{ChatMessage, Reaction},
};
use storage::{ContactStore, MessageStore, UnreadBatch};
use tokio::sync::Mutex;

use crate::{
    ai::{AiRequest, AiResponder, AiStream},
    config::ClientSettings,
    session::{Session, SessionDeps},
    transport::{ConnectionStatus, LocalBroker},
};

/// Polls `$cond` (which may `.await`) until it holds or five seconds pass.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
pub(crate) use eventually;

/// In-memory stand-in for the shared SQLite store with the same query
/// semantics, plus knobs for failures and slow history loads.
#[derive(Default)]
pub(crate) struct MemoryStore {
    messages: Mutex<Vec<ChatMessage>>,
    contacts: Mutex<HashMap<UserId, Vec<Contact>>>,
    last_logout: Mutex<HashMap<UserId, DateTime<Utc>>>,
    presence: Mutex<HashMap<UserId, PresenceState>>,
    fail_saves: AtomicBool,
    save_calls: AtomicUsize,
    history_delay_ms: AtomicU64,
    save_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn delay_history(&self, delay: Duration) {
        self.history_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn delay_saves(&self, delay: Duration) {
        self.save_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) async fn rows(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    pub(crate) async fn row(&self, id: &MessageId) -> Option<ChatMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .find(|message| &message.id == id)
            .cloned()
    }

    pub(crate) async fn presence(&self, user: &UserId) -> Option<PresenceState> {
        self.presence.lock().await.get(user).copied()
    }

    async fn groups_of(&self, user: &UserId) -> Vec<ConversationId> {
        self.contacts
            .lock()
            .await
            .get(user)
            .map(|contacts| {
                contacts
                    .iter()
                    .filter(|contact| contact.is_group)
                    .map(|contact| contact.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        let mut messages = self.messages.lock().await;
        if !messages.iter().any(|existing| existing.id == message.id) {
            messages.push(message.clone());
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        viewer: &UserId,
        conversation: &Conversation,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let mut matching: Vec<ChatMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|message| match conversation {
                Conversation::Group { group_id } => {
                    message.is_group && &message.conversation_id == group_id
                }
                Conversation::Direct { peer } => {
                    !message.is_group
                        && ((&message.sender_id == viewer && message.conversation_id.as_str() == peer.as_str())
                            || (&message.sender_id == peer && message.conversation_id.as_str() == viewer.as_str()))
                }
            })
            .cloned()
            .collect();

        let delay = self.history_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        matching.sort_by_key(|message| message.timestamp);
        let skip = matching.len().saturating_sub(limit as usize);
        Ok(matching.split_off(skip))
    }

    async fn update_message_status(&self, message_id: &MessageId, status: MessageStatus) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(message) = messages.iter_mut().find(|message| &message.id == message_id) {
            if status.advances(message.status) {
                message.status = Some(status);
            }
        }
        Ok(())
    }

    async fn get_unread_since(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<UnreadBatch> {
        let since = match since {
            Some(since) => Some(since),
            None => self.last_logout.lock().await.get(user_id).copied(),
        };
        let groups = self.groups_of(user_id).await;
        let mut matching: Vec<ChatMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|message| &message.sender_id != user_id)
            .filter(|message| message.status != Some(MessageStatus::Read))
            .filter(|message| since.map_or(true, |since| message.timestamp > since))
            .filter(|message| {
                if message.is_group {
                    groups.contains(&message.conversation_id)
                } else {
                    message.conversation_id.as_str() == user_id.as_str()
                }
            })
            .cloned()
            .collect();
        matching.sort_by_key(|message| message.timestamp);
        matching.truncate(limit as usize);

        let mut batch = UnreadBatch::new();
        for message in matching {
            let key = if message.is_group {
                message.conversation_id.clone()
            } else {
                ConversationId::from(&message.sender_id)
            };
            batch.entry(key).or_default().push(message);
        }
        Ok(batch)
    }

    async fn add_reaction(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(message) = messages.iter_mut().find(|message| &message.id == message_id) {
            let reaction = Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.clone(),
            };
            if !message.reactions.contains(&reaction) {
                message.reactions.push(reaction);
            }
        }
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(message) = messages.iter_mut().find(|message| &message.id == message_id) {
            message
                .reactions
                .retain(|reaction| !(reaction.emoji == emoji && &reaction.user_id == user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn list_contacts(&self, owner: &UserId) -> Result<Vec<Contact>> {
        let presence = self.presence.lock().await.clone();
        Ok(self
            .contacts
            .lock()
            .await
            .get(owner)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut contact| {
                if let Some(status) = presence.get(&UserId::from(&contact.id)) {
                    contact.status = *status;
                }
                contact
            })
            .collect())
    }

    async fn add_contact(&self, owner: &UserId, contact: &Contact) -> Result<()> {
        let mut contacts = self.contacts.lock().await;
        let list = contacts.entry(owner.clone()).or_default();
        list.retain(|existing| existing.id != contact.id);
        list.push(contact.clone());
        Ok(())
    }

    async fn update_user_status(&self, user_id: &UserId, status: PresenceState, at: DateTime<Utc>) -> Result<()> {
        self.presence.lock().await.insert(user_id.clone(), status);
        if status == PresenceState::Offline {
            self.last_logout.lock().await.insert(user_id.clone(), at);
        }
        Ok(())
    }
}

/// Replies with fixed chunks, or fails when built with [`ScriptedAi::failing`].
pub(crate) struct ScriptedAi {
    chunks: Vec<String>,
    fail: bool,
    requests: Mutex<Vec<AiRequest>>,
}

impl ScriptedAi {
    pub(crate) fn replying(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) async fn requests(&self) -> Vec<AiRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl AiResponder for ScriptedAi {
    async fn respond(&self, request: AiRequest) -> Result<AiStream> {
        self.requests.lock().await.push(request);
        if self.fail {
            return Err(anyhow!("model quota exceeded"));
        }
        let chunks: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

pub(crate) fn fast_settings() -> ClientSettings {
    ClientSettings {
        reconnect_initial_backoff: Duration::from_millis(20),
        reconnect_max_backoff: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(1),
        ..ClientSettings::default()
    }
}

/// Registers `peers` as direct contacts of `id` in the shared store.
pub(crate) async fn befriend(store: &MemoryStore, id: &str, peers: &[(&str, &str)]) {
    for (peer, name) in peers {
        store
            .add_contact(&UserId::from(id), &Contact::person(*peer, *name))
            .await
            .expect("add contact");
    }
}

pub(crate) async fn login(
    broker: &LocalBroker,
    store: &Arc<MemoryStore>,
    ai: Arc<dyn AiResponder>,
    id: &str,
    name: &str,
) -> Session {
    login_with(broker, store, ai, id, name, fast_settings()).await
}

/// Logs in and waits until the first connect has finished its catch-up.
pub(crate) async fn login_with(
    broker: &LocalBroker,
    store: &Arc<MemoryStore>,
    ai: Arc<dyn AiResponder>,
    id: &str,
    name: &str,
    settings: ClientSettings,
) -> Session {
    let session = Session::login(
        LocalUser::new(id, name),
        settings,
        SessionDeps {
            link: Arc::new(broker.clone()),
            messages: store.clone(),
            contacts: store.clone(),
            ai,
        },
    )
    .await
    .expect("login");
    eventually!(
        "first catch-up to finish",
        session.engine().caught_up_epoch() >= 1
    );
    assert_eq!(session.engine().connection_status(), ConnectionStatus::Connected);
    session
}

//! Reconciliation engine: applies inbound events to the conversation
//! store, drives outbound sends and runs catch-up after reconnects.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::domain::{
    Contact, Conversation, ConversationId, LocalUser, MessageId, MessageStatus, PresenceState,
    UserId,
};
use storage::{ContactStore, MessageStore};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    ai::{default_personas, AiResponder},
    config::ClientSettings,
    contacts::ContactDirectory,
    store::{ConversationStore, LocalMessage, Persistence, StatusOrigin},
    topics::{self, TopicRouter},
    transport::{ConnectionStatus, InboundMessage, TransportAdapter},
    SyncEvent,
};

mod inbound;
mod outbound;

pub use outbound::SendOptions;

pub struct EngineDeps {
    pub messages: Arc<dyn MessageStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub ai: Arc<dyn AiResponder>,
}

struct EngineState {
    store: ConversationStore,
    contacts: ContactDirectory,
    router: TopicRouter,
    active: Option<ConversationId>,
    history_loads: HashMap<ConversationId, u64>,
    first_unread: HashMap<ConversationId, MessageId>,
}

pub struct SyncEngine {
    me: LocalUser,
    settings: ClientSettings,
    transport: Arc<TransportAdapter>,
    messages: Arc<dyn MessageStore>,
    contact_store: Arc<dyn ContactStore>,
    ai: Arc<dyn AiResponder>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<SyncEvent>,
    caught_up_epoch: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        me: LocalUser,
        settings: ClientSettings,
        transport: Arc<TransportAdapter>,
        deps: EngineDeps,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Mutex::new(EngineState {
                store: ConversationStore::new(),
                contacts: ContactDirectory::new(default_personas()),
                router: TopicRouter::new(me.id.clone()),
                active: None,
                history_loads: HashMap::new(),
                first_unread: HashMap::new(),
            }),
            me,
            settings,
            transport,
            messages: deps.messages,
            contact_store: deps.contacts,
            ai: deps.ai,
            events,
            caught_up_epoch: AtomicU64::new(0),
        })
    }

    /// Spawns the inbound loop, the connection watcher and the health
    /// check. The caller owns the handles and aborts them on logout.
    pub fn start(
        self: &Arc<Self>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_inbound_loop(inbound),
            self.spawn_connection_watcher(),
            self.spawn_watchdog(),
        ]
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn me(&self) -> &LocalUser {
        &self.me
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Connect epoch whose catch-up has finished; 0 before the first one.
    pub fn caught_up_epoch(&self) -> u64 {
        self.caught_up_epoch.load(Ordering::SeqCst)
    }

    /// Requests the personal inbox and every contact topic, then loads the
    /// contact list. Subscriptions made before connecting are replayed by
    /// the transport.
    pub async fn bootstrap(&self) -> Result<()> {
        self.transport.subscribe(&topics::inbox_topic(&self.me.id)).await?;
        self.refresh_contacts().await
    }

    pub async fn refresh_contacts(&self) -> Result<()> {
        let contacts = self.contact_store.list_contacts(&self.me.id).await?;
        let new_topics = {
            let mut state = self.inner.lock().await;
            state.contacts.replace_all(contacts);
            let listed = state.contacts.list();
            let mut new_topics = Vec::new();
            for contact in listed.iter().filter(|contact| !is_ai_direct(contact)) {
                if let Some(topic) = state.router.track(&contact.conversation()) {
                    new_topics.push(topic);
                    if !contact.is_group {
                        new_topics.push(topics::status_topic(&UserId::from(&contact.id)));
                    }
                }
            }
            new_topics
        };
        for topic in new_topics {
            if let Err(err) = self.transport.subscribe(&topic).await {
                warn!(topic = %topic, error = %err, "sync: subscribe after contact refresh failed");
            }
        }
        let _ = self.events.send(SyncEvent::ContactsChanged);
        Ok(())
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.lock().await.contacts.list()
    }

    pub async fn messages(&self, key: &ConversationId) -> Vec<shared::protocol::ChatMessage> {
        self.inner.lock().await.store.snapshot(key)
    }

    pub async fn local_message(&self, key: &ConversationId, id: &MessageId) -> Option<LocalMessage> {
        self.inner.lock().await.store.find(key, id).cloned()
    }

    pub async fn unread(&self, key: &ConversationId) -> u32 {
        self.inner.lock().await.store.unread(key)
    }

    pub async fn unread_counts(&self) -> HashMap<ConversationId, u32> {
        self.inner.lock().await.store.unread_counts()
    }

    /// Names of users typing in `key`, sorted by user id.
    pub async fn typing(&self, key: &ConversationId) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .store
            .typing(key)
            .map(|typing| typing.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn first_unread(&self, key: &ConversationId) -> Option<MessageId> {
        self.inner.lock().await.first_unread.get(key).cloned()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active.clone()
    }

    fn spawn_inbound_loop(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                engine.handle_inbound(message).await;
            }
        })
    }

    /// Reacts to connection changes. Catch-up runs on every new connect
    /// epoch, which marks a transition into `Connected`.
    fn spawn_connection_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut state_rx = self.transport.watch_state();
        tokio::spawn(async move {
            let mut seen_epoch = 0;
            let mut last_status = ConnectionStatus::Disconnected;
            loop {
                let snapshot = state_rx.borrow_and_update().clone();
                if snapshot.status != last_status {
                    let _ = engine
                        .events
                        .send(SyncEvent::ConnectionStatusChanged(snapshot.status));
                    if last_status == ConnectionStatus::Connected {
                        let at = snapshot.offline_since.unwrap_or_else(Utc::now);
                        engine.record_own_presence(PresenceState::Offline, at).await;
                    }
                    last_status = snapshot.status;
                }
                if snapshot.epoch > seen_epoch {
                    seen_epoch = snapshot.epoch;
                    engine.on_connected(snapshot.epoch, snapshot.offline_since).await;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Forces a reconnect when the transport is found down on two
    /// consecutive health checks, i.e. for at least one whole interval.
    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = self.settings.health_check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut was_down = false;
            loop {
                ticker.tick().await;
                match engine.transport.status() {
                    ConnectionStatus::Connected | ConnectionStatus::Connecting => was_down = false,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                        if !was_down {
                            was_down = true;
                        } else if engine.transport.force_reconnect().await {
                            info!("sync: health check forced a reconnect");
                            was_down = false;
                        }
                    }
                }
            }
        })
    }

    async fn on_connected(&self, epoch: u64, offline_since: Option<DateTime<Utc>>) {
        self.record_own_presence(PresenceState::Online, Utc::now()).await;
        self.promote_queued().await;
        self.catch_up(offline_since).await;
        self.caught_up_epoch.fetch_max(epoch, Ordering::SeqCst);
    }

    pub(crate) async fn record_own_presence(&self, status: PresenceState, at: DateTime<Utc>) {
        if let Err(err) = self
            .contact_store
            .update_user_status(&self.me.id, status, at)
            .await
        {
            warn!(status = status.as_str(), error = %err, "sync: failed to record own presence");
        }
    }

    /// Queued messages were flushed by the transport on connect; move
    /// them to `sent`.
    async fn promote_queued(&self) {
        let promoted = {
            let mut state = self.inner.lock().await;
            let queued = state.store.queued_outgoing(&self.me.id);
            for (key, id) in &queued {
                state
                    .store
                    .patch_message_status(key, id, MessageStatus::Sent, StatusOrigin::Local);
            }
            queued
        };
        if promoted.is_empty() {
            return;
        }
        info!(count = promoted.len(), "sync: promoted queued messages to sent");
        let mut touched = Vec::new();
        for (key, id) in promoted {
            if let Err(err) = self
                .messages
                .update_message_status(&id, MessageStatus::Sent)
                .await
            {
                warn!(message_id = %id, error = %err, "sync: failed to persist promoted status");
            }
            if !touched.contains(&key) {
                touched.push(key);
            }
        }
        for key in touched {
            self.emit_updated(&key);
        }
    }

    /// Merges messages missed while offline, counts the newly inserted ones
    /// as unread and acknowledges them to their senders.
    async fn catch_up(&self, since: Option<DateTime<Utc>>) {
        let limit = self.settings.catch_up_limit;
        let batch = match self
            .messages
            .get_unread_since(&self.me.id, since, limit)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "sync: catch-up fetch failed");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("catch-up failed: {err}")));
                return;
            }
        };

        let fetched: usize = batch.values().map(Vec::len).sum();
        if fetched >= limit as usize {
            warn!(limit, "sync: catch-up hit its limit; older messages load with history");
        }

        let mut touched = Vec::new();
        let mut unread_updates = Vec::new();
        let mut receipts = Vec::new();
        let mut unknown_senders = false;
        let mut inserted_total = 0;
        {
            let mut state = self.inner.lock().await;
            for (key, messages) in batch {
                unknown_senders |= messages.iter().any(|message| {
                    !state
                        .contacts
                        .is_known(&ConversationId::from(&message.sender_id))
                });
                let is_group = messages.iter().any(|message| message.is_group);
                let senders: HashMap<MessageId, UserId> = messages
                    .iter()
                    .map(|message| (message.id.clone(), message.sender_id.clone()))
                    .collect();
                let inserted = state.store.merge_messages(&key, messages);
                if inserted.is_empty() {
                    continue;
                }
                inserted_total += inserted.len();

                // Already-known messages were counted when they arrived live.
                if state.active.as_ref() != Some(&key) {
                    let fresh = u32::try_from(inserted.len()).unwrap_or(u32::MAX);
                    let count = state.store.add_unread(&key, fresh);
                    unread_updates.push((key.clone(), count));
                }
                let acknowledged: Vec<MessageId> = inserted
                    .into_iter()
                    .filter(|id| {
                        senders.get(id).is_some_and(|sender| {
                            !state.contacts.is_ai(&ConversationId::from(sender))
                        })
                    })
                    .collect();
                if !acknowledged.is_empty() {
                    receipts.push((key.clone(), is_group, acknowledged));
                }
                touched.push(key);
            }
        }

        for key in &touched {
            self.emit_updated(key);
        }
        for (key, count) in unread_updates {
            let _ = self.events.send(SyncEvent::UnreadChanged {
                conversation_id: key,
                count,
            });
        }
        // Fetched rows are already durable, so they can be acknowledged.
        for (key, is_group, ids) in receipts {
            self.publish_delivery_receipt(&key, is_group, ids).await;
        }
        if unknown_senders {
            if let Err(err) = self.refresh_contacts().await {
                warn!(error = %err, "sync: contact refresh after catch-up failed");
            }
        }
        info!(fetched, inserted = inserted_total, "sync: catch-up complete");
        let _ = self.events.send(SyncEvent::CatchUpCompleted {
            fetched,
            inserted: inserted_total,
        });
    }

    async fn ensure_subscribed(&self, conversation: &Conversation) {
        let topic = {
            let mut state = self.inner.lock().await;
            if !conversation.is_group() && state.contacts.is_ai(&conversation.key()) {
                return;
            }
            state.router.track(conversation)
        };
        if let Some(topic) = topic {
            if let Err(err) = self.transport.subscribe(&topic).await {
                warn!(topic = %topic, error = %err, "sync: subscribe failed");
            }
        }
    }

    fn emit_updated(&self, key: &ConversationId) {
        let _ = self.events.send(SyncEvent::ConversationUpdated {
            conversation_id: key.clone(),
        });
    }

    fn set_persistence(state: &mut EngineState, key: &ConversationId, id: &MessageId, ok: bool) {
        let persistence = if ok {
            Persistence::Confirmed
        } else {
            Persistence::Failed
        };
        state.store.set_persistence(key, id, persistence);
    }
}

fn is_ai_direct(contact: &Contact) -> bool {
    contact.is_ai && !contact.is_group
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, PresenceState, UserId},
    protocol::{
        ChatEvent, ChatMessage, FriendAccepted, Invitation, Reaction, ReactionAction,
        ReactionEvent, Receipt, TypingIndicator, TypingState,
    },
};
use tracing::{debug, info, warn};

use super::{EngineState, SyncEngine};
use crate::{
    codec,
    store::{Persistence, Upsert},
    topics::{self, USER_NAMESPACE},
    transport::InboundMessage,
    SyncEvent,
};

impl SyncEngine {
    pub(crate) async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        if let Some(user_id) = presence_subject(&message.topic) {
            self.apply_presence(user_id, &message.payload).await;
            return;
        }
        let Some(event) = codec::decode_or_log(&message.topic, &message.payload) else {
            return;
        };
        self.apply_event(event).await;
    }

    /// Applies one decoded event. Never fails; problems are logged.
    pub async fn apply_event(self: &Arc<Self>, event: ChatEvent) {
        if let Some(originator) = event.originator() {
            if originator == &self.me.id {
                if !matches!(event, ChatEvent::Chat(_)) {
                    debug!(kind = event.kind(), "sync: ignoring self-originated event");
                    return;
                }
            } else {
                self.note_activity(originator).await;
            }
        }

        match event {
            ChatEvent::Chat(message) => self.apply_chat(message).await,
            ChatEvent::Invitation(invitation) => self.apply_invitation(invitation).await,
            ChatEvent::ReadReceipt(receipt) => self.apply_receipt(receipt, MessageStatus::Read).await,
            ChatEvent::DeliveryReceipt(receipt) => {
                self.apply_receipt(receipt, MessageStatus::Delivered).await
            }
            ChatEvent::Typing(typing) => self.apply_typing(typing).await,
            ChatEvent::Reaction(reaction) => self.apply_reaction(reaction).await,
            ChatEvent::FriendRequestAccepted(accepted) => self.apply_friend_accepted(accepted).await,
        }
    }

    async fn apply_chat(self: &Arc<Self>, message: ChatMessage) {
        let from_me = message.sender_id == self.me.id;
        let key = if message.is_group || from_me {
            message.conversation_id.clone()
        } else {
            ConversationId::from(&message.sender_id)
        };
        let sender_key = ConversationId::from(&message.sender_id);

        let (unread, sender_known, sender_is_ai) = {
            let mut state = self.inner.lock().await;
            if state.store.upsert_message(&key, message.clone(), Persistence::Pending)
                == Upsert::Existing
            {
                debug!(message_id = %message.id, conversation_id = %key, "sync: duplicate chat ignored");
                return;
            }
            let typing_cleared = state.store.typing(&key).is_some_and(|typing| {
                typing.contains_key(&message.sender_id)
            });
            state.store.set_typing(&key, &message.sender_id, None);
            if typing_cleared {
                let names = typing_names(&state, &key);
                let _ = self.events.send(SyncEvent::TypingChanged {
                    conversation_id: key.clone(),
                    names,
                });
            }
            let unread = (!from_me && state.active.as_ref() != Some(&key))
                .then(|| state.store.increment_unread(&key));
            (
                unread,
                from_me || state.contacts.is_known(&sender_key),
                state.contacts.is_ai(&sender_key),
            )
        };

        self.emit_updated(&key);
        if let Some(count) = unread {
            let _ = self.events.send(SyncEvent::UnreadChanged {
                conversation_id: key.clone(),
                count,
            });
        }

        if !sender_known {
            info!(sender_id = %message.sender_id, "sync: message from unknown sender, refreshing contacts");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = engine.refresh_contacts().await {
                    warn!(error = %err, "sync: contact refresh failed");
                }
            });
        }

        let saved = match self.messages.save_message(&message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "sync: failed to persist inbound message");
                false
            }
        };
        {
            let mut state = self.inner.lock().await;
            Self::set_persistence(&mut state, &key, &message.id, saved);
        }

        if saved && !from_me && !sender_is_ai {
            self.publish_delivery_receipt(&key, message.is_group, vec![message.id.clone()])
                .await;
        }
    }

    pub(super) async fn publish_delivery_receipt(
        &self,
        key: &ConversationId,
        is_group: bool,
        message_ids: Vec<MessageId>,
    ) {
        let topic = if is_group {
            topics::group_topic(key)
        } else {
            topics::direct_topic(&self.me.id, &UserId::from(key))
        };
        let count = message_ids.len();
        let receipt = ChatEvent::DeliveryReceipt(Receipt {
            conversation_id: key.clone(),
            reader_id: self.me.id.clone(),
            message_ids: Some(message_ids),
        });
        if let Err(err) = self.transport.publish(&topic, &receipt).await {
            warn!(conversation_id = %key, count, error = %err, "sync: delivery receipt not sent");
        }
    }

    async fn apply_receipt(&self, receipt: Receipt, status: MessageStatus) {
        let (key, advanced) = {
            let mut state = self.inner.lock().await;
            let key = Self::peer_key(&state, &receipt.conversation_id, &receipt.reader_id);
            let advanced = state.store.apply_receipt(
                &key,
                &self.me.id,
                receipt.message_ids.as_deref(),
                status,
            );
            (key, advanced)
        };
        if advanced.is_empty() {
            return;
        }
        debug!(
            conversation_id = %key,
            count = advanced.len(),
            status = status.as_str(),
            "sync: receipt advanced messages"
        );
        for id in &advanced {
            if let Err(err) = self.messages.update_message_status(id, status).await {
                warn!(message_id = %id, error = %err, "sync: failed to persist receipt status");
            }
        }
        self.emit_updated(&key);
    }

    async fn apply_typing(&self, typing: TypingIndicator) {
        let (key, names) = {
            let mut state = self.inner.lock().await;
            let key = Self::peer_key(&state, &typing.conversation_id, &typing.user_id);
            let name = match typing.state {
                TypingState::Start => Some(typing.user_name),
                TypingState::Stop => None,
            };
            state.store.set_typing(&key, &typing.user_id, name);
            let names = typing_names(&state, &key);
            (key, names)
        };
        let _ = self.events.send(SyncEvent::TypingChanged {
            conversation_id: key,
            names,
        });
    }

    async fn apply_reaction(&self, event: ReactionEvent) {
        let (key, changed) = {
            let mut state = self.inner.lock().await;
            let key = Self::peer_key(&state, &event.conversation_id, &event.reactor_id);
            let reaction = Reaction {
                emoji: event.emoji.clone(),
                user_id: event.reactor_id.clone(),
            };
            let changed = state
                .store
                .patch_reactions(&key, &event.message_id, reaction, event.action);
            (key, changed)
        };
        if !changed {
            return;
        }
        let persisted = match event.action {
            ReactionAction::Add => {
                self.messages
                    .add_reaction(&event.message_id, &event.reactor_id, &event.emoji)
                    .await
            }
            ReactionAction::Remove => {
                self.messages
                    .remove_reaction(&event.message_id, &event.reactor_id, &event.emoji)
                    .await
            }
        };
        if let Err(err) = persisted {
            warn!(message_id = %event.message_id, error = %err, "sync: failed to persist reaction");
        }
        self.emit_updated(&key);
    }

    async fn apply_invitation(&self, invitation: Invitation) {
        let Invitation { mut contact, topic } = invitation;
        contact.status = PresenceState::Online;
        contact.last_seen = Some(Utc::now());
        let conversation = contact.conversation();
        {
            let mut state = self.inner.lock().await;
            if !state.contacts.insert(contact.clone()) {
                return;
            }
            state.router.track(&conversation);
        }
        info!(contact_id = %contact.id, topic = %topic, "sync: accepted invitation");
        if let Err(err) = self.transport.subscribe(&topic).await {
            warn!(topic = %topic, error = %err, "sync: subscribe for invitation failed");
        }
        if let Err(err) = self.contact_store.add_contact(&self.me.id, &contact).await {
            warn!(contact_id = %contact.id, error = %err, "sync: failed to persist invited contact");
        }
        let _ = self.events.send(SyncEvent::ContactsChanged);
    }

    async fn apply_friend_accepted(&self, accepted: FriendAccepted) {
        if accepted.requester_id != self.me.id {
            return;
        }
        info!(accepter_id = %accepted.accepter_id, "sync: friend request accepted, refreshing contacts");
        if let Err(err) = self.refresh_contacts().await {
            warn!(error = %err, "sync: contact refresh failed");
        }
    }

    async fn apply_presence(&self, user_id: UserId, payload: &[u8]) {
        if user_id == self.me.id {
            return;
        }
        let update = match codec::decode_presence(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "codec: dropping undecodable presence");
                return;
            }
        };
        {
            let mut state = self.inner.lock().await;
            state
                .contacts
                .set_presence(&ConversationId::from(&user_id), update.status, update.timestamp);
        }
        let _ = self.events.send(SyncEvent::ContactsChanged);
    }

    /// Any event from a contact proves it is online.
    async fn note_activity(&self, user_id: &UserId) {
        let changed = {
            let mut state = self.inner.lock().await;
            state
                .contacts
                .mark_online(&ConversationId::from(user_id), Utc::now())
        };
        if changed {
            let _ = self.events.send(SyncEvent::ContactsChanged);
        }
    }

    /// Local key for an event about `conversation_id` produced by `actor`.
    /// Group events keep the group id; direct events are keyed by the
    /// actor, since the payload names the conversation from their side.
    fn peer_key(state: &EngineState, conversation_id: &ConversationId, actor: &UserId) -> ConversationId {
        if state.contacts.is_group(conversation_id) {
            conversation_id.clone()
        } else {
            ConversationId::from(actor)
        }
    }
}

fn typing_names(state: &EngineState, key: &ConversationId) -> Vec<String> {
    state
        .store
        .typing(key)
        .map(|typing| typing.values().cloned().collect())
        .unwrap_or_default()
}

/// `user/{id}/status` topics carry presence rather than events.
fn presence_subject(topic: &str) -> Option<UserId> {
    let rest = topic.strip_prefix(USER_NAMESPACE)?.strip_prefix('/')?;
    let user_id = rest.strip_suffix("/status")?;
    (!user_id.is_empty()).then(|| UserId::from(user_id))
}

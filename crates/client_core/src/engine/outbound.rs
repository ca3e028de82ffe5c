use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::{Contact, Conversation, ConversationId, MessageId, MessageStatus, UserId},
    protocol::{
        Attachment, ChatEvent, ChatMessage, FriendAccepted, Invitation, Reaction, ReactionAction,
        ReactionEvent, Receipt, ReplyRef, TypingIndicator, TypingState,
    },
};
use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::{
    ai::{group_prompt, AiRequest, AI_FALLBACK_TEXT},
    store::{Persistence, StatusOrigin},
    topics,
    transport::PublishOutcome,
    SyncEvent,
};

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ReplyRef>,
    pub forwarded: bool,
}

impl SyncEngine {
    /// Creates a message, shows it immediately, persists it and then
    /// publishes it (or hands it to the AI responder for persona chats).
    pub async fn send_message(
        self: &Arc<Self>,
        conversation: &Conversation,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId> {
        let key = conversation.key();
        let status = if self.transport.is_connected() {
            MessageStatus::Sent
        } else {
            MessageStatus::Queued
        };
        let message = ChatMessage {
            id: MessageId::generate(),
            conversation_id: key.clone(),
            text: text.to_string(),
            sender_id: self.me.id.clone(),
            sender_name: self.me.name.clone(),
            timestamp: Utc::now(),
            status: Some(status),
            attachment: options.attachment,
            reactions: Vec::new(),
            is_forwarded: options.forwarded,
            is_group: conversation.is_group(),
            reply_to: options.reply_to,
        };
        let id = message.id.clone();

        {
            let mut state = self.inner.lock().await;
            state
                .store
                .upsert_message(&key, message.clone(), Persistence::Pending);
        }
        self.emit_updated(&key);
        self.ensure_subscribed(conversation).await;
        self.persist_and_dispatch(conversation, message).await;
        Ok(id)
    }

    /// Re-runs persistence and publish for a message whose save failed.
    pub async fn retry_message(self: &Arc<Self>, key: &ConversationId, id: &MessageId) -> Result<()> {
        let message = {
            let mut state = self.inner.lock().await;
            let local = state
                .store
                .find(key, id)
                .ok_or_else(|| anyhow!("message {id} not found in {key}"))?;
            if local.persistence != Persistence::Failed {
                return Ok(());
            }
            let message = local.message.clone();
            state.store.set_persistence(key, id, Persistence::Pending);
            message
        };
        let conversation = if message.is_group {
            Conversation::group(key.clone())
        } else {
            Conversation::direct(UserId::from(key))
        };
        info!(message_id = %id, "sync: retrying message");
        self.persist_and_dispatch(&conversation, message).await;
        Ok(())
    }

    async fn persist_and_dispatch(self: &Arc<Self>, conversation: &Conversation, message: ChatMessage) {
        let key = conversation.key();
        let saved = match self.messages.save_message(&message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "sync: failed to persist outgoing message");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("message {} was not saved: {err}", message.id)));
                false
            }
        };
        let (persona, mentioned, group) = {
            let mut state = self.inner.lock().await;
            Self::set_persistence(&mut state, &key, &message.id, saved);
            let persona = (!conversation.is_group())
                .then(|| state.contacts.get(&key).filter(|c| c.is_ai).cloned())
                .flatten();
            let mentioned = if conversation.is_group() {
                state.contacts.mentioned_personas(&key, &message.text)
            } else {
                Vec::new()
            };
            (persona, mentioned, state.contacts.get(&key).cloned())
        };
        self.emit_updated(&key);
        if !saved {
            return;
        }

        if let Some(persona) = persona {
            self.spawn_ai_reply(persona, message, None);
            return;
        }

        let topic = topics::topic_for(&self.me.id, conversation);
        match self
            .transport
            .publish(&topic, &ChatEvent::Chat(message.clone()))
            .await
        {
            Ok(PublishOutcome::Sent) if self.settings.optimistic_delivery => {
                let changed = {
                    let mut state = self.inner.lock().await;
                    state.store.patch_message_status(
                        &key,
                        &message.id,
                        MessageStatus::Delivered,
                        StatusOrigin::Optimistic,
                    )
                };
                if changed {
                    self.emit_updated(&key);
                }
            }
            Ok(outcome) => {
                debug!(message_id = %message.id, ?outcome, "sync: message handed to transport");
            }
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "sync: message could not be published");
            }
        }

        if let Some(group) = group {
            for persona in mentioned {
                self.spawn_ai_reply(persona, message.clone(), Some(group.clone()));
            }
        }
    }

    /// Loads history, marks incoming messages read with one batched
    /// receipt and clears the unread counter.
    pub async fn open_conversation(self: &Arc<Self>, conversation: &Conversation) -> Result<()> {
        let key = conversation.key();
        let (generation, watermark, is_ai) = {
            let mut state = self.inner.lock().await;
            state.active = Some(key.clone());
            let generation = state.history_loads.entry(key.clone()).or_insert(0);
            *generation += 1;
            let generation = *generation;
            let is_ai = !conversation.is_group() && state.contacts.is_ai(&key);
            (generation, state.store.watermark(), is_ai)
        };
        self.ensure_subscribed(conversation).await;

        let loaded = self
            .messages
            .get_messages(&self.me.id, conversation, self.settings.history_page_size)
            .await;

        let read_ids = {
            let mut state = self.inner.lock().await;
            // A newer open of this conversation owns the history and read state.
            if state.history_loads.get(&key) != Some(&generation) {
                debug!(conversation_id = %key, generation, "sync: discarding stale history load");
                return Ok(());
            }
            match loaded {
                Ok(loaded) => state.store.replace_history(&key, loaded, watermark),
                Err(err) => {
                    warn!(conversation_id = %key, error = %err, "sync: history load failed, keeping local state");
                }
            }

            let unread = state.store.unread(&key) as usize;
            let snapshot = state.store.snapshot(&key);
            let first_unread = (unread > 0)
                .then(|| snapshot.len().checked_sub(unread))
                .flatten()
                .and_then(|index| snapshot.get(index))
                .map(|message| message.id.clone());
            match first_unread {
                Some(id) => {
                    state.first_unread.insert(key.clone(), id);
                }
                None => {
                    state.first_unread.remove(&key);
                }
            }

            let read_ids = if is_ai {
                Vec::new()
            } else {
                state.store.unread_incoming(&key, &self.me.id)
            };
            for id in &read_ids {
                state
                    .store
                    .patch_message_status(&key, id, MessageStatus::Read, StatusOrigin::Local);
            }
            state.store.clear_unread(&key);
            read_ids
        };

        for id in &read_ids {
            if let Err(err) = self.messages.update_message_status(id, MessageStatus::Read).await {
                warn!(message_id = %id, error = %err, "sync: failed to persist read status");
            }
        }
        if !read_ids.is_empty() {
            let receipt = ChatEvent::ReadReceipt(Receipt {
                conversation_id: key.clone(),
                reader_id: self.me.id.clone(),
                message_ids: Some(read_ids),
            });
            let topic = topics::topic_for(&self.me.id, conversation);
            if let Err(err) = self.transport.publish(&topic, &receipt).await {
                warn!(conversation_id = %key, error = %err, "sync: read receipt not sent");
            }
        }

        self.emit_updated(&key);
        let _ = self.events.send(SyncEvent::UnreadChanged {
            conversation_id: key,
            count: 0,
        });
        Ok(())
    }

    pub async fn close_conversation(&self) {
        self.inner.lock().await.active = None;
    }

    pub async fn set_typing(&self, conversation: &Conversation, typing: bool) -> Result<()> {
        let key = conversation.key();
        if !conversation.is_group() && self.inner.lock().await.contacts.is_ai(&key) {
            return Ok(());
        }
        let event = ChatEvent::Typing(TypingIndicator {
            conversation_id: key,
            user_id: self.me.id.clone(),
            user_name: self.me.name.clone(),
            state: if typing {
                TypingState::Start
            } else {
                TypingState::Stop
            },
        });
        self.transport
            .publish(&topics::topic_for(&self.me.id, conversation), &event)
            .await?;
        Ok(())
    }

    /// Adds the reaction if the local user has not made it yet, removes
    /// it otherwise.
    pub async fn toggle_reaction(
        &self,
        conversation: &Conversation,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionAction> {
        let key = conversation.key();
        let (action, is_ai) = {
            let mut state = self.inner.lock().await;
            let local = state
                .store
                .find(&key, message_id)
                .ok_or_else(|| anyhow!("message {message_id} not found in {key}"))?;
            let action = if local.message.has_reaction(emoji, &self.me.id) {
                ReactionAction::Remove
            } else {
                ReactionAction::Add
            };
            let reaction = Reaction {
                emoji: emoji.to_string(),
                user_id: self.me.id.clone(),
            };
            state.store.patch_reactions(&key, message_id, reaction, action);
            (action, !conversation.is_group() && state.contacts.is_ai(&key))
        };
        self.emit_updated(&key);

        let persisted = match action {
            ReactionAction::Add => self.messages.add_reaction(message_id, &self.me.id, emoji).await,
            ReactionAction::Remove => {
                self.messages
                    .remove_reaction(message_id, &self.me.id, emoji)
                    .await
            }
        };
        if let Err(err) = persisted {
            warn!(message_id = %message_id, error = %err, "sync: failed to persist reaction");
        }

        if !is_ai {
            let event = ChatEvent::Reaction(ReactionEvent {
                conversation_id: key,
                message_id: message_id.clone(),
                reactor_id: self.me.id.clone(),
                emoji: emoji.to_string(),
                action,
            });
            self.transport
                .publish(&topics::topic_for(&self.me.id, conversation), &event)
                .await?;
        }
        Ok(action)
    }

    pub async fn forward_message(
        self: &Arc<Self>,
        from: &ConversationId,
        message_id: &MessageId,
        to: &Conversation,
    ) -> Result<MessageId> {
        let original = {
            let state = self.inner.lock().await;
            state
                .store
                .find(from, message_id)
                .map(|local| local.message.clone())
                .ok_or_else(|| anyhow!("message {message_id} not found in {from}"))?
        };
        let options = SendOptions {
            attachment: original.attachment,
            reply_to: None,
            forwarded: true,
        };
        self.send_message(to, &original.text, options).await
    }

    /// Registers a freshly created group and invites its human members
    /// through their inboxes.
    pub async fn announce_group(&self, group: Contact) -> Result<()> {
        if !group.is_group {
            return Err(anyhow!("contact {} is not a group", group.id));
        }
        self.contact_store
            .add_contact(&self.me.id, &group)
            .await
            .with_context(|| format!("failed to store group {}", group.id))?;

        let conversation = group.conversation();
        let topic = topics::group_topic(&group.id);
        let invitees: Vec<UserId> = {
            let mut state = self.inner.lock().await;
            state.contacts.insert(group.clone());
            state.router.track(&conversation);
            group
                .member_ids
                .iter()
                .filter(|member| *member != &self.me.id)
                .filter(|member| !state.contacts.is_ai(&ConversationId::from(*member)))
                .cloned()
                .collect()
        };
        self.transport.subscribe(&topic).await?;

        let invitation = ChatEvent::Invitation(Invitation {
            contact: group.clone(),
            topic,
        });
        for member in &invitees {
            self.transport
                .publish(&topics::inbox_topic(member), &invitation)
                .await?;
        }
        info!(group_id = %group.id, invited = invitees.len(), "sync: announced group");
        let _ = self.events.send(SyncEvent::ContactsChanged);
        Ok(())
    }

    pub async fn notify_friend_accepted(&self, requester: &UserId) -> Result<()> {
        let event = ChatEvent::FriendRequestAccepted(FriendAccepted {
            accepter_id: self.me.id.clone(),
            accepter_name: self.me.name.clone(),
            requester_id: requester.clone(),
        });
        self.transport
            .publish(&topics::inbox_topic(requester), &event)
            .await?;
        self.refresh_contacts().await
    }

    fn spawn_ai_reply(self: &Arc<Self>, persona: Contact, prompt_message: ChatMessage, group: Option<Contact>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_ai_reply(persona, prompt_message, group).await;
        });
    }

    /// Streams a persona reply into the conversation. In direct chats the
    /// prompting message goes to `delivered` once the stream opens and to
    /// `read` when it ends; group replies are broadcast on the group topic.
    async fn run_ai_reply(&self, persona: Contact, prompt_message: ChatMessage, group: Option<Contact>) {
        let key = prompt_message.conversation_id.clone();
        let mut reply = ChatMessage {
            id: MessageId::generate(),
            conversation_id: match &group {
                Some(group) => group.id.clone(),
                None => ConversationId::from(&self.me.id),
            },
            text: String::new(),
            sender_id: UserId::from(&persona.id),
            sender_name: persona.name.clone(),
            timestamp: Utc::now(),
            // The user reads a direct reply as it streams in.
            status: Some(if group.is_some() {
                MessageStatus::Sent
            } else {
                MessageStatus::Read
            }),
            attachment: None,
            reactions: Vec::new(),
            is_forwarded: false,
            is_group: group.is_some(),
            reply_to: None,
        };

        let history = {
            let mut state = self.inner.lock().await;
            let history = state.store.snapshot(&key);
            state.store.upsert_message(&key, reply.clone(), Persistence::Pending);
            history
        };
        self.emit_updated(&key);

        let prompt = match &group {
            Some(group) => group_prompt(
                &persona,
                &group.name,
                &prompt_message.sender_name,
                &prompt_message.text,
            ),
            None => prompt_message.text.clone(),
        };
        let request = AiRequest {
            persona: persona.clone(),
            prompt,
            history,
        };

        let mut full = String::new();
        let streamed: Result<()> = async {
            let mut stream = self.ai.respond(request).await?;
            if group.is_none() {
                self.mark_prompt_status(&key, &prompt_message.id, MessageStatus::Delivered)
                    .await;
            }
            while let Some(chunk) = stream.next().await {
                full.push_str(&chunk?);
                self.inner
                    .lock()
                    .await
                    .store
                    .replace_text(&key, &reply.id, full.clone());
                self.emit_updated(&key);
            }
            Ok(())
        }
        .await;

        match streamed {
            Ok(()) if !full.trim().is_empty() => {
                reply.text = full.trim().to_string();
                reply.timestamp = Utc::now();
                self.inner
                    .lock()
                    .await
                    .store
                    .replace_text(&key, &reply.id, reply.text.clone());
                let saved = match self.messages.save_message(&reply).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(persona = %persona.id, error = %err, "sync: failed to persist AI reply");
                        false
                    }
                };
                {
                    let mut state = self.inner.lock().await;
                    Self::set_persistence(&mut state, &key, &reply.id, saved);
                }
                if group.is_some() {
                    let topic = topics::group_topic(&key);
                    if let Err(err) = self.transport.publish(&topic, &ChatEvent::Chat(reply.clone())).await {
                        warn!(persona = %persona.id, error = %err, "sync: AI reply not broadcast");
                    }
                }
            }
            Ok(()) => {
                debug!(persona = %persona.id, "sync: AI returned an empty reply");
                self.inner
                    .lock()
                    .await
                    .store
                    .discard_unconfirmed(&key, &reply.id);
            }
            Err(err) => {
                warn!(persona = %persona.id, error = %err, "sync: AI reply failed");
                self.inner
                    .lock()
                    .await
                    .store
                    .replace_text(&key, &reply.id, AI_FALLBACK_TEXT.to_string());
            }
        }

        if group.is_none() {
            self.mark_prompt_status(&key, &prompt_message.id, MessageStatus::Read)
                .await;
        }
        self.emit_updated(&key);
    }

    async fn mark_prompt_status(&self, key: &ConversationId, id: &MessageId, status: MessageStatus) {
        let changed = {
            let mut state = self.inner.lock().await;
            state
                .store
                .patch_message_status(key, id, status, StatusOrigin::Receipt)
        };
        if !changed {
            return;
        }
        if let Err(err) = self.messages.update_message_status(id, status).await {
            warn!(message_id = %id, error = %err, "sync: failed to persist AI chat status");
        }
        self.emit_updated(key);
    }
}

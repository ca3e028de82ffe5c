use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Contact, Conversation, ConversationId, LocalUser, MessageId, MessageStatus,
        PresenceState, UserId,
    },
    protocol::{wire_time, Attachment, AttachmentKind, ChatMessage, Reaction, ReplyRef},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};

/// Messages missed while offline, grouped by local conversation key
/// (group id for groups, sender id for direct chats).
pub type UnreadBatch = HashMap<ConversationId, Vec<ChatMessage>>;

/// Durable message history. Every call is fallible; callers log failures
/// and keep their optimistic local state.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> Result<()>;
    async fn get_messages(
        &self,
        viewer: &UserId,
        conversation: &Conversation,
        limit: u32,
    ) -> Result<Vec<ChatMessage>>;
    async fn update_message_status(&self, message_id: &MessageId, status: MessageStatus)
        -> Result<()>;
    /// Incoming messages not yet read, newer than `since` (or the user's
    /// last logout when `since` is `None`), oldest first, at most `limit`.
    async fn get_unread_since(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<UnreadBatch>;
    async fn add_reaction(&self, message_id: &MessageId, user_id: &UserId, emoji: &str)
        -> Result<()>;
    async fn remove_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        emoji: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn list_contacts(&self, owner: &UserId) -> Result<Vec<Contact>>;
    async fn add_contact(&self, owner: &UserId, contact: &Contact) -> Result<()>;
    /// Records presence; going offline also stamps the last logout time
    /// used as the default catch-up window.
    async fn update_user_status(
        &self,
        user_id: &UserId,
        status: PresenceState,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, sender_name, recipient_id, group_id, text, status, sent_at, attachment_url, is_forwarded, reply_to";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &LocalUser) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user {}", user.id))?;
        Ok(())
    }

    pub async fn last_logout_at(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_logout_at FROM users WHERE id = ?")
                .bind(user_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.flatten().as_deref().and_then(wire_time::parse))
    }

    pub async fn user_status(&self, user_id: &UserId) -> Result<Option<PresenceState>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT status FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(raw.as_deref().map(PresenceState::parse))
    }

    async fn attach_reactions(&self, messages: &mut [ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for message in messages.iter() {
            ids.push_bind(message.id.0.clone());
        }
        ids.push_unseparated(") ORDER BY created_at ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut by_message: HashMap<String, Vec<Reaction>> = HashMap::new();
        for row in rows {
            by_message
                .entry(row.try_get("message_id")?)
                .or_default()
                .push(Reaction {
                    emoji: row.try_get("emoji")?,
                    user_id: UserId(row.try_get("user_id")?),
                });
        }

        for message in messages.iter_mut() {
            if let Some(reactions) = by_message.remove(message.id.as_str()) {
                message.reactions = reactions;
            }
        }
        Ok(())
    }
}

fn status_rank(status: MessageStatus) -> i64 {
    match status {
        MessageStatus::Queued => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Delivered => 2,
        MessageStatus::Read => 3,
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let group_id: Option<String> = row.try_get("group_id")?;
    let recipient_id: Option<String> = row.try_get("recipient_id")?;
    let sent_at: String = row.try_get("sent_at")?;
    let status: Option<String> = row.try_get("status")?;
    let attachment_url: Option<String> = row.try_get("attachment_url")?;
    let reply_to: Option<String> = row.try_get("reply_to")?;

    let conversation_id = group_id
        .clone()
        .or(recipient_id)
        .context("message row has neither group nor recipient")?;
    let timestamp = wire_time::parse(&sent_at)
        .with_context(|| format!("invalid stored timestamp: {sent_at}"))?;
    let reply_to = reply_to
        .as_deref()
        .map(serde_json::from_str::<ReplyRef>)
        .transpose()
        .context("invalid stored reply reference")?;

    Ok(ChatMessage {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(conversation_id),
        text: row.try_get("text")?,
        sender_id: UserId(row.try_get("sender_id")?),
        sender_name: row.try_get("sender_name")?,
        timestamp,
        status: status.as_deref().and_then(MessageStatus::parse),
        attachment: attachment_url.map(|url| Attachment {
            kind: AttachmentKind::Image,
            url,
        }),
        reactions: Vec::new(),
        is_forwarded: row.try_get::<i64, _>("is_forwarded")? != 0,
        is_group: group_id.is_some(),
        reply_to,
    })
}

fn contact_from_row(row: &SqliteRow) -> Result<Contact> {
    let member_ids: String = row.try_get("member_ids")?;
    let member_ids: Vec<UserId> =
        serde_json::from_str(&member_ids).context("invalid stored member list")?;
    let status: Option<String> = row.try_get("status")?;
    let last_seen_at: Option<String> = row.try_get("last_seen_at")?;
    let creator_id: Option<String> = row.try_get("creator_id")?;

    Ok(Contact {
        id: ConversationId(row.try_get("contact_id")?),
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        system_instruction: row.try_get("system_instruction")?,
        is_group: row.try_get::<i64, _>("is_group")? != 0,
        is_ai: row.try_get::<i64, _>("is_ai")? != 0,
        member_ids,
        creator_id: creator_id.map(UserId),
        is_pinned: row.try_get::<i64, _>("is_pinned")? != 0,
        status: status
            .as_deref()
            .map(PresenceState::parse)
            .unwrap_or_default(),
        last_seen: last_seen_at.as_deref().and_then(wire_time::parse),
    })
}

#[async_trait]
impl MessageStore for Storage {
    async fn save_message(&self, message: &ChatMessage) -> Result<()> {
        let (recipient_id, group_id) = if message.is_group {
            (None, Some(message.conversation_id.as_str()))
        } else {
            (Some(message.conversation_id.as_str()), None)
        };
        let reply_to = message
            .reply_to
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO messages (id, sender_id, sender_name, recipient_id, group_id, text, status, sent_at, attachment_url, is_forwarded, reply_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.id.as_str())
        .bind(message.sender_id.as_str())
        .bind(&message.sender_name)
        .bind(recipient_id)
        .bind(group_id)
        .bind(&message.text)
        .bind(message.status.map(MessageStatus::as_str))
        .bind(wire_time::format(&message.timestamp))
        .bind(message.attachment.as_ref().map(|a| a.url.as_str()))
        .bind(i64::from(message.is_forwarded))
        .bind(reply_to)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save message {}", message.id))?;

        for reaction in &message.reactions {
            self.add_reaction(&message.id, &reaction.user_id, &reaction.emoji)
                .await?;
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        viewer: &UserId,
        conversation: &Conversation,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let rows = match conversation {
            Conversation::Group { group_id } => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE group_id = ?1
                     ORDER BY sent_at DESC
                     LIMIT ?2"
                ))
                .bind(group_id.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            Conversation::Direct { peer } => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE group_id IS NULL
                       AND ((sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1))
                     ORDER BY sent_at DESC
                     LIMIT ?3"
                ))
                .bind(viewer.as_str())
                .bind(peer.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        self.attach_reactions(&mut messages).await?;
        Ok(messages)
    }

    async fn update_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET status = ?1
             WHERE id = ?2
               AND (status IS NULL OR CASE status
                    WHEN 'queued' THEN 0
                    WHEN 'sent' THEN 1
                    WHEN 'delivered' THEN 2
                    WHEN 'read' THEN 3
                    ELSE -1 END < ?3)",
        )
        .bind(status.as_str())
        .bind(message_id.as_str())
        .bind(status_rank(status))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update status of message {message_id}"))?;
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
            None => self.last_logout_at(user_id).await?,
        };

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sender_id != ?1
               AND (status IS NULL OR status != 'read')
               AND (?2 IS NULL OR sent_at > ?2)
               AND (recipient_id = ?1
                    OR group_id IN (SELECT contact_id FROM contacts WHERE owner_id = ?1 AND is_group = 1))
             ORDER BY sent_at ASC
             LIMIT ?3"
        ))
        .bind(user_id.as_str())
        .bind(since.as_ref().map(wire_time::format))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_reactions(&mut messages).await?;

        let mut batch = UnreadBatch::new();
        for message in messages {
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
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id.as_str())
        .bind(user_id.as_str())
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        emoji: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3")
            .bind(message_id.as_str())
            .bind(user_id.as_str())
            .bind(emoji)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ContactStore for Storage {
    async fn list_contacts(&self, owner: &UserId) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT c.contact_id, c.name, c.avatar_url, c.system_instruction, c.is_group, c.is_ai,
                    c.member_ids, c.creator_id, c.is_pinned, u.status, u.last_seen_at
             FROM contacts c
             LEFT JOIN users u ON u.id = c.contact_id
             WHERE c.owner_id = ?1
             ORDER BY c.is_pinned DESC, c.created_at DESC",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(contact_from_row).collect()
    }

    async fn add_contact(&self, owner: &UserId, contact: &Contact) -> Result<()> {
        let member_ids = serde_json::to_string(&contact.member_ids)?;
        sqlx::query(
            "INSERT INTO contacts (owner_id, contact_id, name, avatar_url, system_instruction, is_group, is_ai, member_ids, creator_id, is_pinned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(owner_id, contact_id) DO UPDATE SET
                name = excluded.name,
                avatar_url = excluded.avatar_url,
                member_ids = excluded.member_ids,
                is_pinned = excluded.is_pinned",
        )
        .bind(owner.as_str())
        .bind(contact.id.as_str())
        .bind(&contact.name)
        .bind(contact.avatar_url.as_deref())
        .bind(contact.system_instruction.as_deref())
        .bind(i64::from(contact.is_group))
        .bind(i64::from(contact.is_ai))
        .bind(member_ids)
        .bind(contact.creator_id.as_ref().map(UserId::as_str))
        .bind(i64::from(contact.is_pinned))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to add contact {} for {owner}", contact.id))?;
        Ok(())
    }

    async fn update_user_status(
        &self,
        user_id: &UserId,
        status: PresenceState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let at = wire_time::format(&at);
        sqlx::query(
            "UPDATE users SET
                status = ?1,
                last_seen_at = ?2,
                last_logout_at = CASE WHEN ?1 = 'offline' THEN ?2 ELSE last_logout_at END
             WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

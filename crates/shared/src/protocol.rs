use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Contact, ConversationId, MessageId, MessageStatus, PresenceState, UserId},
    error::ApiError,
};

/// Wire representation of timestamps: ISO-8601 with millisecond precision
/// and a `Z` suffix. Decoding also accepts integer epoch milliseconds.
pub mod wire_time {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Millis(i64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Text(raw) => parse(&raw)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
            RawTimestamp::Millis(millis) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {millis}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
}

/// A chat message as it travels on the wire and sits in the stores.
///
/// For direct chats `conversation_id` is the recipient as seen by the
/// sender; for groups it is the group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(alias = "contactId")]
    pub conversation_id: ConversationId,
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_forwarded: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
}

impl ChatMessage {
    pub fn has_reaction(&self, emoji: &str, user_id: &UserId) -> bool {
        self.reactions
            .iter()
            .any(|reaction| reaction.emoji == emoji && &reaction.user_id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub contact: Contact,
    pub topic: String,
}

/// Delivery or read acknowledgement. `message_ids = None` is the legacy
/// form meaning "every message from me in this conversation".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    #[serde(alias = "contactId")]
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<MessageId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingState {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    #[serde(alias = "contactId")]
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub user_name: String,
    pub state: TypingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEvent {
    #[serde(alias = "contactId")]
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub reactor_id: UserId,
    pub emoji: String,
    pub action: ReactionAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendAccepted {
    pub accepter_id: UserId,
    pub accepter_name: String,
    pub requester_id: UserId,
}

/// Every payload that travels on `chat/...` and `user/...` topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Chat(ChatMessage),
    Invitation(Invitation),
    ReadReceipt(Receipt),
    DeliveryReceipt(Receipt),
    Typing(TypingIndicator),
    Reaction(ReactionEvent),
    FriendRequestAccepted(FriendAccepted),
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Invitation(_) => "invitation",
            Self::ReadReceipt(_) => "read_receipt",
            Self::DeliveryReceipt(_) => "delivery_receipt",
            Self::Typing(_) => "typing",
            Self::Reaction(_) => "reaction",
            Self::FriendRequestAccepted(_) => "friend_request_accepted",
        }
    }

    /// The user that produced this event, when the payload names one.
    pub fn originator(&self) -> Option<&UserId> {
        match self {
            Self::Chat(message) => Some(&message.sender_id),
            Self::ReadReceipt(receipt) | Self::DeliveryReceipt(receipt) => Some(&receipt.reader_id),
            Self::Typing(typing) => Some(&typing.user_id),
            Self::Reaction(reaction) => Some(&reaction.reactor_id),
            Self::FriendRequestAccepted(accepted) => Some(&accepted.accepter_id),
            Self::Invitation(_) => None,
        }
    }
}

/// Retained payload on `user/{id}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub status: PresenceState,
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
}

/// Frames exchanged between a client link and the relay broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum BrokerFrame {
    Hello {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        will: Option<WillFrame>,
    },
    Subscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: String,
        #[serde(default)]
        retain: bool,
    },
    Deliver {
        topic: String,
        payload: String,
    },
    Goodbye,
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillFrame {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

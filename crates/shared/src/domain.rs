use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConversationId);

impl MessageId {
    /// Fresh sender-assigned id; the transport and the store never mint ids.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&UserId> for ConversationId {
    fn from(value: &UserId) -> Self {
        Self(value.0.clone())
    }
}

impl From<&ConversationId> for UserId {
    fn from(value: &ConversationId) -> Self {
        Self(value.0.clone())
    }
}

/// Delivery state of a message as seen by one observer.
///
/// Variant order is the progression order, so `Ord` doubles as the
/// "is later than" relation used by every status merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// True when moving from `current` to `self` is a forward step.
    pub fn advances(self, current: Option<MessageStatus>) -> bool {
        current.map_or(true, |current| self > current)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Away,
    #[default]
    Offline,
}

impl PresenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "online" => Self::Online,
            "away" => Self::Away,
            _ => Self::Offline,
        }
    }
}

/// Which conversation a message or event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Conversation {
    Direct { peer: UserId },
    Group { group_id: ConversationId },
}

impl Conversation {
    pub fn direct(peer: impl Into<UserId>) -> Self {
        Self::Direct { peer: peer.into() }
    }

    pub fn group(group_id: impl Into<ConversationId>) -> Self {
        Self::Group {
            group_id: group_id.into(),
        }
    }

    /// Key of this conversation in the local state store.
    pub fn key(&self) -> ConversationId {
        match self {
            Self::Direct { peer } => ConversationId::from(peer),
            Self::Group { group_id } => group_id.clone(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ConversationId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_ai: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<UserId>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub status: PresenceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

impl Contact {
    pub fn person(id: impl Into<ConversationId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
            system_instruction: None,
            is_group: false,
            is_ai: false,
            member_ids: Vec::new(),
            creator_id: None,
            is_pinned: false,
            status: PresenceState::Offline,
            last_seen: None,
        }
    }

    pub fn group(
        id: impl Into<ConversationId>,
        name: impl Into<String>,
        creator_id: UserId,
        member_ids: Vec<UserId>,
    ) -> Self {
        Self {
            is_group: true,
            creator_id: Some(creator_id),
            member_ids,
            ..Self::person(id, name)
        }
    }

    pub fn conversation(&self) -> Conversation {
        if self.is_group {
            Conversation::group(self.id.clone())
        } else {
            Conversation::direct(UserId::from(&self.id))
        }
    }
}

/// The signed-in identity a session runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    pub name: String,
}

impl LocalUser {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

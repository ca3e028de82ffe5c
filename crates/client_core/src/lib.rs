//! Client side of the chat sync core: broker transport, conversation
//! state and the engine that reconciles the two with durable storage.

use shared::domain::ConversationId;

pub mod ai;
pub mod codec;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod error;
pub mod session;
pub mod store;
pub mod topics;
pub mod transport;

pub use ai::{AiRequest, AiResponder, AiStream, MissingAiResponder};
pub use config::{load_settings, ClientSettings};
pub use engine::{EngineDeps, SendOptions, SyncEngine};
pub use session::{Session, SessionDeps};
pub use transport::{ConnectionStatus, LocalBroker, TransportAdapter, WsBrokerLink};

/// Change notifications for whoever renders the client. Each event names
/// what changed; current values are read back from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConversationUpdated {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        count: u32,
    },
    TypingChanged {
        conversation_id: ConversationId,
        names: Vec<String>,
    },
    ConnectionStatusChanged(ConnectionStatus),
    ContactsChanged,
    CatchUpCompleted {
        fetched: usize,
        inserted: usize,
    },
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

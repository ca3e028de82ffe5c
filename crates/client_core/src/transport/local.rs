use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use super::{BrokerConnection, BrokerLink, ConnectOptions, LastWill, LinkEvent, LinkHandle};
use crate::error::TransportError;

/// Everything the in-process broker did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRecord {
    Connected { client_id: String },
    Subscribed { client_id: String, topic: String },
    Published { client_id: String, topic: String, retain: bool },
    Disconnected { client_id: String, clean: bool },
}

struct LocalClient {
    client_id: String,
    topics: BTreeSet<String>,
    sender: mpsc::UnboundedSender<LinkEvent>,
    will: Option<LastWill>,
}

struct LocalBrokerState {
    available: bool,
    next_session: u64,
    clients: HashMap<u64, LocalClient>,
    retained: BTreeMap<String, Vec<u8>>,
    journal: Vec<BrokerRecord>,
}

impl LocalBrokerState {
    fn route(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            self.retained.insert(topic.to_string(), payload.to_vec());
        }
        for client in self.clients.values() {
            if client.topics.contains(topic) {
                let _ = client.sender.send(LinkEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn drop_session(&mut self, session: u64, reason: &str) {
        let Some(client) = self.clients.remove(&session) else {
            return;
        };
        self.journal.push(BrokerRecord::Disconnected {
            client_id: client.client_id.clone(),
            clean: false,
        });
        if let Some(will) = client.will {
            self.journal.push(BrokerRecord::Published {
                client_id: client.client_id.clone(),
                topic: will.topic.clone(),
                retain: will.retain,
            });
            self.route(&will.topic, &will.payload, will.retain);
        }
        let _ = client.sender.send(LinkEvent::Closed {
            reason: reason.to_string(),
            unsent: Vec::new(),
        });
    }
}

/// In-process broker with MQTT-like semantics: exact-match topics,
/// retained messages, last wills and delivery back to the publisher.
/// Used by tests and the offline demo mode.
#[derive(Clone)]
pub struct LocalBroker {
    state: Arc<Mutex<LocalBrokerState>>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalBrokerState {
                available: true,
                next_session: 0,
                clients: HashMap::new(),
                retained: BTreeMap::new(),
                journal: Vec::new(),
            })),
        }
    }

    /// Taking the broker down drops every session uncleanly, firing
    /// their last wills. New connects fail until it is back up.
    pub async fn set_available(&self, available: bool) {
        let mut state = self.state.lock().await;
        state.available = available;
        if !available {
            let sessions: Vec<u64> = state.clients.keys().copied().collect();
            for session in sessions {
                state.drop_session(session, "broker unavailable");
            }
        }
        info!(available, "broker: local availability changed");
    }

    /// Drops the sessions of one client as if its network vanished.
    pub async fn sever(&self, client_id: &str) {
        let mut state = self.state.lock().await;
        let sessions: Vec<u64> = state
            .clients
            .iter()
            .filter(|(_, client)| client.client_id == client_id)
            .map(|(session, _)| *session)
            .collect();
        for session in sessions {
            state.drop_session(session, "connection severed");
        }
    }

    pub async fn journal(&self) -> Vec<BrokerRecord> {
        self.state.lock().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }

    pub async fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().await.retained.get(topic).cloned()
    }

    pub async fn connected_clients(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .clients
            .values()
            .map(|client| client.client_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BrokerLink for LocalBroker {
    async fn open(&self, options: ConnectOptions) -> Result<LinkHandle, TransportError> {
        let mut state = self.state.lock().await;
        if !state.available {
            return Err(TransportError::Connect("local broker unavailable".into()));
        }
        let session = state.next_session;
        state.next_session += 1;

        let (sender, events) = mpsc::unbounded_channel();
        state.clients.insert(
            session,
            LocalClient {
                client_id: options.client_id.clone(),
                topics: BTreeSet::new(),
                sender,
                will: options.will,
            },
        );
        state.journal.push(BrokerRecord::Connected {
            client_id: options.client_id.clone(),
        });

        Ok(LinkHandle {
            connection: Arc::new(LocalConnection {
                broker: self.clone(),
                session,
                client_id: options.client_id,
            }),
            events,
        })
    }
}

struct LocalConnection {
    broker: LocalBroker,
    session: u64,
    client_id: String,
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        let retained = state.retained.get(topic).cloned();
        let client = state
            .clients
            .get_mut(&self.session)
            .ok_or(TransportError::Closed)?;
        client.topics.insert(topic.to_string());
        if let Some(payload) = retained {
            let _ = client.sender.send(LinkEvent::Message {
                topic: topic.to_string(),
                payload,
            });
        }
        state.journal.push(BrokerRecord::Subscribed {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        if !state.clients.contains_key(&self.session) {
            return Err(TransportError::Closed);
        }
        state.journal.push(BrokerRecord::Published {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            retain,
        });
        state.route(topic, payload, retain);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        if state.clients.remove(&self.session).is_some() {
            state.journal.push(BrokerRecord::Disconnected {
                client_id: self.client_id.clone(),
                clean: true,
            });
        }
        Ok(())
    }
}

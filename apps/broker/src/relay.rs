use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use shared::protocol::{BrokerFrame, WillFrame};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub(crate) type SessionId = u64;

struct Session {
    client_id: String,
    topics: BTreeSet<String>,
    will: Option<WillFrame>,
    outbound: mpsc::UnboundedSender<BrokerFrame>,
}

#[derive(Default)]
struct RelayState {
    next_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    retained: BTreeMap<String, String>,
}

impl RelayState {
    fn route(&mut self, topic: &str, payload: &str, retain: bool) -> usize {
        if retain {
            self.retained.insert(topic.to_string(), payload.to_string());
        }
        let mut delivered = 0;
        for session in self.sessions.values() {
            if session.topics.contains(topic) {
                let frame = BrokerFrame::Deliver {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                };
                if session.outbound.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct RelayStats {
    pub sessions: usize,
    pub retained: usize,
}

/// Topic fan-out shared by every WebSocket connection. Topics match
/// exactly; the last retained payload per topic is replayed on
/// subscribe; a session that ends without `goodbye` fires its will.
#[derive(Default)]
pub(crate) struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub(crate) async fn register(
        &self,
        client_id: String,
        will: Option<WillFrame>,
        outbound: mpsc::UnboundedSender<BrokerFrame>,
    ) -> SessionId {
        let mut state = self.state.lock().await;
        let id = state.next_session;
        state.next_session += 1;
        info!(session = id, client_id = %client_id, has_will = will.is_some(), "broker: session opened");
        state.sessions.insert(
            id,
            Session {
                client_id,
                topics: BTreeSet::new(),
                will,
                outbound,
            },
        );
        id
    }

    pub(crate) async fn subscribe(&self, session: SessionId, topic: String) {
        let mut state = self.state.lock().await;
        let retained = state.retained.get(&topic).cloned();
        let Some(entry) = state.sessions.get_mut(&session) else {
            return;
        };
        if let Some(payload) = retained {
            let _ = entry.outbound.send(BrokerFrame::Deliver {
                topic: topic.clone(),
                payload,
            });
        }
        debug!(session, topic = %topic, "broker: subscribed");
        entry.topics.insert(topic);
    }

    pub(crate) async fn publish(&self, topic: &str, payload: &str, retain: bool) -> usize {
        let delivered = self.state.lock().await.route(topic, payload, retain);
        debug!(topic, retain, delivered, "broker: published");
        delivered
    }

    /// Ends a session. Unclean endings publish the registered will.
    pub(crate) async fn close(&self, session: SessionId, clean: bool) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.sessions.remove(&session) else {
            return;
        };
        info!(session, client_id = %entry.client_id, clean, "broker: session closed");
        if clean {
            return;
        }
        if let Some(will) = entry.will {
            state.route(&will.topic, &will.payload, will.retain);
        }
    }

    pub(crate) async fn stats(&self) -> RelayStats {
        let state = self.state.lock().await;
        RelayStats {
            sessions: state.sessions.len(),
            retained: state.retained.len(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn retained(&self, topic: &str) -> Option<String> {
        self.state.lock().await.retained.get(topic).cloned()
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;

//! Broker connection management: subscriptions, the offline publish
//! queue, presence and automatic reconnection.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{PresenceState, UserId},
    protocol::{ChatEvent, PresenceUpdate},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{codec, config::ClientSettings, error::TransportError, topics};

pub mod local;
pub mod ws;

pub use local::{BrokerRecord, LocalBroker};
pub use ws::WsBrokerLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Observable connection state. `epoch` increases on every successful
/// connect so observers can detect a reconnect even if intermediate
/// states were coalesced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub status: ConnectionStatus,
    pub epoch: u64,
    pub offline_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub will: Option<LastWill>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The session ended. `unsent` holds publishes the link accepted but
    /// never wrote, oldest first.
    Closed {
        reason: String,
        unsent: Vec<QueuedPublish>,
    },
}

/// One open broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError>;
    /// Clean close; the broker must not fire the last will.
    async fn close(&self) -> Result<(), TransportError>;
}

pub struct LinkHandle {
    pub connection: Arc<dyn BrokerConnection>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens broker sessions. Implemented over WebSocket and in-process.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn open(&self, options: ConnectOptions) -> Result<LinkHandle, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Queued,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub queue_limit: usize,
}

impl From<&ClientSettings> for TransportSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            initial_backoff: settings.reconnect_initial_backoff,
            max_backoff: settings.reconnect_max_backoff,
            connect_timeout: settings.connect_timeout,
            queue_limit: settings.publish_queue_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct AdapterState {
    identity: Option<UserId>,
    connection: Option<Arc<dyn BrokerConnection>>,
    subscriptions: Vec<String>,
    queue: VecDeque<QueuedPublish>,
    explicit_disconnect: bool,
    generation: u64,
    reconnecting: bool,
    reader: Option<JoinHandle<()>>,
}

pub struct TransportAdapter {
    link: Arc<dyn BrokerLink>,
    settings: TransportSettings,
    inner: Mutex<AdapterState>,
    state: watch::Sender<LinkState>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl TransportAdapter {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        settings: TransportSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState {
            status: ConnectionStatus::Disconnected,
            epoch: 0,
            offline_since: None,
        });
        let adapter = Arc::new(Self {
            link,
            settings,
            inner: Mutex::new(AdapterState {
                identity: None,
                connection: None,
                subscriptions: Vec::new(),
                queue: VecDeque::new(),
                explicit_disconnect: false,
                generation: 0,
                reconnecting: false,
                reader: None,
            }),
            state,
            inbound,
        });
        (adapter, inbound_rx)
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Opens the session for `identity`. A no-op when already connected
    /// as the same identity.
    pub async fn connect(self: &Arc<Self>, identity: &UserId) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        if guard.connection.is_some() && guard.identity.as_ref() == Some(identity) {
            return Ok(());
        }
        if let Some(previous) = guard.connection.take() {
            let _ = previous.close().await;
        }
        guard.identity = Some(identity.clone());
        guard.explicit_disconnect = false;
        let result = self.open_locked(&mut guard).await;
        if result.is_err() {
            drop(guard);
            self.spawn_reconnect().await;
        }
        result
    }

    /// User-initiated close. Drops queued work, announces offline and
    /// suppresses automatic reconnection.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        guard.explicit_disconnect = true;
        guard.subscriptions.clear();
        guard.queue.clear();
        if let Some(reader) = guard.reader.take() {
            reader.abort();
        }
        if let Some(connection) = guard.connection.take() {
            if let Some(identity) = guard.identity.as_ref() {
                match presence_payload(PresenceState::Offline) {
                    Ok(payload) => {
                        if let Err(err) = connection
                            .publish(&topics::status_topic(identity), &payload, true)
                            .await
                        {
                            warn!(user_id = %identity, error = %err, "transport: offline announcement failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "transport: offline announcement not encodable"),
                }
            }
            if let Err(err) = connection.close().await {
                warn!(error = %err, "transport: close failed");
            }
        }
        if let Some(identity) = guard.identity.take() {
            info!(user_id = %identity, "transport: disconnected by user");
        }
        self.set_offline(ConnectionStatus::Disconnected);
        Ok(())
    }

    /// Idempotent. Offline requests are recorded and replayed on connect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        if guard.subscriptions.iter().any(|existing| existing == topic) {
            return Ok(());
        }
        guard.subscriptions.push(topic.to_string());
        if let Some(connection) = guard.connection.clone() {
            if let Err(err) = connection.subscribe(topic).await {
                warn!(topic, error = %err, "transport: subscribe failed, will replay on reconnect");
            }
        }
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().await.subscriptions.clone()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn publish(&self, topic: &str, event: &ChatEvent) -> Result<PublishOutcome, TransportError> {
        let payload = codec::encode(event)?;
        Ok(self.publish_raw(topic, payload, false).await)
    }

    /// Sends now when connected, otherwise queues in FIFO order. A failed
    /// send is requeued rather than reported.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>, retain: bool) -> PublishOutcome {
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connection.clone() {
            match connection.publish(topic, &payload, retain).await {
                Ok(()) => return PublishOutcome::Sent,
                Err(err) => {
                    warn!(topic, error = %err, "transport: publish failed, requeueing");
                }
            }
        }
        self.enqueue(
            &mut guard,
            QueuedPublish {
                topic: topic.to_string(),
                payload,
                retain,
            },
        );
        PublishOutcome::Queued
    }

    /// Health-check hook: attempts a connect right away if the adapter is
    /// not connected and has not been told to stay down. Returns whether
    /// an attempt was made.
    pub async fn force_reconnect(self: &Arc<Self>) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.connection.is_some() || guard.explicit_disconnect || guard.identity.is_none() {
            return false;
        }
        info!("transport: forcing reconnect");
        if let Err(err) = self.open_locked(&mut guard).await {
            warn!(error = %err, "transport: forced reconnect failed");
            drop(guard);
            self.spawn_reconnect().await;
        }
        true
    }

    fn enqueue(&self, state: &mut AdapterState, item: QueuedPublish) {
        let limit = self.settings.queue_limit.max(1);
        while state.queue.len() >= limit {
            if let Some(dropped) = state.queue.pop_front() {
                warn!(topic = %dropped.topic, limit, "transport: publish queue full, dropping oldest");
            }
        }
        state.queue.push_back(item);
    }

    /// Puts publishes a dead link never wrote ahead of anything queued
    /// since, keeping their order.
    fn requeue_front(&self, state: &mut AdapterState, items: Vec<QueuedPublish>) {
        for item in items.into_iter().rev() {
            state.queue.push_front(item);
        }
        let limit = self.settings.queue_limit.max(1);
        while state.queue.len() > limit {
            if let Some(dropped) = state.queue.pop_front() {
                warn!(topic = %dropped.topic, limit, "transport: publish queue full, dropping oldest");
            }
        }
    }

    /// Opens a link and brings it to `Connected`: subscriptions first,
    /// then the queued publishes, then the online announcement.
    async fn open_locked(self: &Arc<Self>, state: &mut AdapterState) -> Result<(), TransportError> {
        let identity = state.identity.clone().ok_or(TransportError::MissingIdentity)?;
        self.set_status(ConnectionStatus::Connecting);

        let will = LastWill {
            topic: topics::status_topic(&identity),
            payload: presence_payload(PresenceState::Offline)?,
            retain: true,
        };
        let options = ConnectOptions {
            client_id: identity.to_string(),
            will: Some(will),
            connect_timeout: self.settings.connect_timeout,
        };
        let opened = tokio::time::timeout(self.settings.connect_timeout, self.link.open(options)).await;
        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                self.set_offline(ConnectionStatus::Error);
                return Err(err);
            }
            Err(_) => {
                self.set_offline(ConnectionStatus::Error);
                return Err(TransportError::Timeout(self.settings.connect_timeout));
            }
        };

        for topic in &state.subscriptions {
            if let Err(err) = handle.connection.subscribe(topic).await {
                let _ = handle.connection.close().await;
                self.set_offline(ConnectionStatus::Error);
                return Err(err);
            }
        }

        let flushed = state.queue.len();
        while let Some(item) = state.queue.pop_front() {
            if let Err(err) = handle
                .connection
                .publish(&item.topic, &item.payload, item.retain)
                .await
            {
                state.queue.push_front(item);
                let _ = handle.connection.close().await;
                self.set_offline(ConnectionStatus::Error);
                return Err(err);
            }
        }

        let online = presence_payload(PresenceState::Online)?;
        if let Err(err) = handle
            .connection
            .publish(&topics::status_topic(&identity), &online, true)
            .await
        {
            warn!(user_id = %identity, error = %err, "transport: online announcement failed");
        }

        state.generation += 1;
        state.connection = Some(handle.connection);
        state.reader = Some(self.spawn_reader(handle.events, state.generation));
        self.set_status(ConnectionStatus::Connected);
        info!(
            user_id = %identity,
            subscriptions = state.subscriptions.len(),
            flushed,
            "transport: connected"
        );
        Ok(())
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let inbound = self.inbound.clone();
        let adapter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let (reason, unsent) = loop {
                match events.recv().await {
                    Some(LinkEvent::Message { topic, payload }) => {
                        let _ = inbound.send(InboundMessage { topic, payload });
                    }
                    Some(LinkEvent::Closed { reason, unsent }) => break (reason, unsent),
                    None => break ("link dropped".to_string(), Vec::new()),
                }
            };
            if let Some(adapter) = adapter.upgrade() {
                adapter.handle_connection_lost(generation, &reason, unsent).await;
            }
        })
    }

    async fn handle_connection_lost(
        self: &Arc<Self>,
        generation: u64,
        reason: &str,
        unsent: Vec<QueuedPublish>,
    ) {
        let requeued = unsent.len();
        {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation || guard.explicit_disconnect {
                return;
            }
            guard.connection = None;
            guard.reader = None;
            self.requeue_front(&mut guard, unsent);
        }
        warn!(reason, requeued, "transport: connection lost");
        self.set_offline(ConnectionStatus::Disconnected);
        self.spawn_reconnect().await;
    }

    async fn spawn_reconnect(self: &Arc<Self>) {
        {
            let mut guard = self.inner.lock().await;
            if guard.reconnecting || guard.explicit_disconnect {
                return;
            }
            guard.reconnecting = true;
        }

        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = adapter.settings.initial_backoff;
            let mut attempt: u32 = 0;
            loop {
                tokio::time::sleep(backoff).await;
                attempt += 1;
                let mut guard = adapter.inner.lock().await;
                if guard.explicit_disconnect
                    || guard.identity.is_none()
                    || guard.connection.is_some()
                {
                    guard.reconnecting = false;
                    return;
                }
                match adapter.open_locked(&mut guard).await {
                    Ok(()) => {
                        guard.reconnecting = false;
                        return;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "transport: reconnect attempt failed");
                    }
                }
                drop(guard);
                backoff = (backoff * 2).min(adapter.settings.max_backoff);
            }
        });
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.send_modify(|state| {
            if status == ConnectionStatus::Connected && state.status != ConnectionStatus::Connected {
                state.epoch += 1;
            }
            state.status = status;
        });
    }

    /// Leaves `Connected`, remembering when the outage began.
    fn set_offline(&self, status: ConnectionStatus) {
        self.state.send_modify(|state| {
            if state.status == ConnectionStatus::Connected {
                state.offline_since = Some(Utc::now());
            }
            state.status = status;
        });
    }
}

fn presence_payload(status: PresenceState) -> Result<Vec<u8>, TransportError> {
    Ok(codec::encode_presence(&PresenceUpdate {
        status,
        timestamp: Utc::now(),
    })?)
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;

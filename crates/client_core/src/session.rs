use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use shared::domain::{LocalUser, PresenceState};
use storage::{ContactStore, MessageStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    ai::AiResponder,
    config::ClientSettings,
    engine::{EngineDeps, SyncEngine},
    transport::{BrokerLink, TransportAdapter, TransportSettings},
};

pub struct SessionDeps {
    pub link: Arc<dyn BrokerLink>,
    pub messages: Arc<dyn MessageStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub ai: Arc<dyn AiResponder>,
}

/// One signed-in user: owns the transport, the engine and its tasks.
pub struct Session {
    user: LocalUser,
    transport: Arc<TransportAdapter>,
    engine: Arc<SyncEngine>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Starts the engine and connects. A broker that is down is not an
    /// error: the transport keeps retrying and queues outgoing traffic.
    pub async fn login(user: LocalUser, settings: ClientSettings, deps: SessionDeps) -> Result<Self> {
        let (transport, inbound) = TransportAdapter::new(deps.link, TransportSettings::from(&settings));
        let engine = SyncEngine::new(
            user.clone(),
            settings,
            Arc::clone(&transport),
            EngineDeps {
                messages: deps.messages,
                contacts: deps.contacts,
                ai: deps.ai,
            },
        );
        let tasks = engine.start(inbound);

        if let Err(err) = engine.bootstrap().await {
            warn!(user_id = %user.id, error = %err, "session: bootstrap incomplete");
        }
        if let Err(err) = transport.connect(&user.id).await {
            warn!(user_id = %user.id, error = %err, "session: initial connect failed, retrying in background");
        }
        info!(user_id = %user.id, "session: logged in");

        Ok(Self {
            user,
            transport,
            engine,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// Clean disconnect: the offline presence is published by the
    /// transport and stamped as the logout time in storage.
    pub async fn logout(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        let disconnected = self.transport.disconnect().await;
        self.engine
            .record_own_presence(PresenceState::Offline, Utc::now())
            .await;
        info!(user_id = %self.user.id, "session: logged out");
        disconnected.map_err(Into::into)
    }
}

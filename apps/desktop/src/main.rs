use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::{load_settings, normalize_database_url},
    engine::SendOptions,
    session::{Session, SessionDeps},
    transport::{BrokerLink, LocalBroker, WsBrokerLink},
    MissingAiResponder, SyncEngine, SyncEvent,
};
use shared::domain::{Conversation, LocalUser};
use storage::Storage;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{info, warn};

/// Terminal chat client: signs in, opens one conversation and sends each
/// stdin line as a message.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    name: String,
    /// Direct-chat peer id.
    #[arg(long, conflicts_with = "group")]
    peer: Option<String>,
    /// Group id to chat in instead of a direct peer.
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    broker_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// Use an in-process broker instead of the network.
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.broker_url.clone() {
        settings.broker_url = url;
    }
    if let Some(url) = args.database_url.as_deref() {
        settings.database_url = normalize_database_url(url);
    }

    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    let user = LocalUser::new(args.user_id.as_str(), args.name.as_str());
    storage.upsert_user(&user).await?;

    let link: Arc<dyn BrokerLink> = if args.local {
        Arc::new(LocalBroker::new())
    } else {
        Arc::new(WsBrokerLink::new(settings.broker_url.clone()))
    };
    let session = Session::login(
        user,
        settings,
        SessionDeps {
            link,
            messages: storage.clone(),
            contacts: storage,
            ai: Arc::new(MissingAiResponder),
        },
    )
    .await?;
    let engine = Arc::clone(session.engine());

    let conversation = match (args.peer, args.group) {
        (_, Some(group)) => Some(Conversation::group(group.as_str())),
        (Some(peer), None) => Some(Conversation::direct(peer.as_str())),
        (None, None) => None,
    };

    let printer = tokio::spawn(print_events(Arc::clone(&engine)));
    if let Some(conversation) = &conversation {
        engine.open_conversation(conversation).await?;
        for message in engine.messages(&conversation.key()).await {
            println!("[{}] {}: {}", message.timestamp, message.sender_name, message.text);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        match &conversation {
            Some(conversation) => {
                if let Err(err) = engine
                    .send_message(conversation, text, SendOptions::default())
                    .await
                {
                    warn!(error = %err, "send failed");
                }
            }
            None => println!("no conversation selected; pass --peer or --group"),
        }
    }

    printer.abort();
    session.logout().await?;
    info!("bye");
    Ok(())
}

async fn print_events(engine: Arc<SyncEngine>) {
    let mut events = engine.subscribe_events();
    while let Some(event) = next_event(&mut events).await {
        match event {
            SyncEvent::ConversationUpdated { conversation_id } => {
                if let Some(last) = engine.messages(&conversation_id).await.last() {
                    let status = last.status.map(|status| status.as_str()).unwrap_or("-");
                    println!("<{conversation_id}> {}: {} ({status})", last.sender_name, last.text);
                }
            }
            SyncEvent::UnreadChanged {
                conversation_id,
                count,
            } => println!("<{conversation_id}> unread: {count}"),
            SyncEvent::TypingChanged {
                conversation_id,
                names,
            } if !names.is_empty() => println!("<{conversation_id}> {} typing...", names.join(", ")),
            SyncEvent::ConnectionStatusChanged(status) => println!("connection: {status:?}"),
            SyncEvent::CatchUpCompleted { fetched, inserted } => {
                println!("caught up: {inserted} new of {fetched} fetched")
            }
            SyncEvent::Error(message) => println!("error: {message}"),
            _ => {}
        }
    }
}

/// Next event, skipping past any the printer fell behind on. `None` once
/// the engine is gone.
async fn next_event(events: &mut broadcast::Receiver<SyncEvent>) -> Option<SyncEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

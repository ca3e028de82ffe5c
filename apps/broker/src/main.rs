use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::BrokerFrame,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod config;
mod relay;

use config::load_settings;
use relay::{Relay, RelayStats};

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let app = build_router(AppState {
        relay: Arc::new(Relay::default()),
    });

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "broker listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.stats().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state.relay, socket))
}

/// One client link. The first frame must be `hello`; afterwards frames
/// are `subscribe`, `publish` and `goodbye`.
async fn ws_connection(relay: Arc<Relay>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let (client_id, will) = match receiver.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<BrokerFrame>(&text) {
            Ok(BrokerFrame::Hello { client_id, will }) => (client_id, will),
            Ok(_) | Err(_) => {
                let _ = send_frame(
                    &mut sender,
                    &BrokerFrame::Error(ApiError::new(
                        ErrorCode::Protocol,
                        "first frame must be hello",
                    )),
                )
                .await;
                return;
            }
        },
        _ => return,
    };

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<BrokerFrame>();
    let session = relay.register(client_id.clone(), will, outbound.clone()).await;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if send_frame(&mut sender, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut clean = false;
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<BrokerFrame>(&text) {
            Ok(BrokerFrame::Subscribe { topic }) => relay.subscribe(session, topic).await,
            Ok(BrokerFrame::Publish {
                topic,
                payload,
                retain,
            }) => {
                relay.publish(&topic, &payload, retain).await;
            }
            Ok(BrokerFrame::Goodbye) => {
                clean = true;
                break;
            }
            Ok(other) => {
                warn!(client_id = %client_id, frame = ?other, "broker: unexpected frame from client");
                let _ = outbound.send(BrokerFrame::Error(ApiError::new(
                    ErrorCode::Protocol,
                    "clients may only subscribe, publish or say goodbye",
                )));
            }
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "broker: malformed frame");
                let _ = outbound.send(BrokerFrame::Error(ApiError::new(
                    ErrorCode::Validation,
                    format!("malformed frame: {err}"),
                )));
            }
        }
    }

    relay.close(session, clean).await;
    send_task.abort();
}

async fn send_frame<S>(sender: &mut S, frame: &BrokerFrame) -> anyhow::Result<()>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{BrokerFrame, WillFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use super::{BrokerConnection, BrokerLink, ConnectOptions, LinkEvent, LinkHandle, QueuedPublish};
use crate::error::TransportError;

/// Broker link speaking [`BrokerFrame`] JSON over a WebSocket.
pub struct WsBrokerLink {
    url: String,
}

impl WsBrokerLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerLink for WsBrokerLink {
    async fn open(&self, options: ConnectOptions) -> Result<LinkHandle, TransportError> {
        let url = Url::parse(&self.url)
            .map_err(|err| TransportError::Connect(format!("invalid broker url {}: {err}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Connect(format!(
                "broker url must start with ws:// or wss://, got {url}"
            )));
        }

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("{url}: {err}")))?;
        let (mut writer, mut reader) = stream.split();

        let will = match options.will {
            Some(will) => Some(WillFrame {
                topic: will.topic,
                payload: String::from_utf8(will.payload)
                    .map_err(|err| TransportError::Connect(format!("last will is not utf-8: {err}")))?,
                retain: will.retain,
            }),
            None => None,
        };
        let hello = encode_frame(&BrokerFrame::Hello {
            client_id: options.client_id,
            will,
        })
        .map_err(TransportError::Connect)?;
        writer
            .send(hello)
            .await
            .map_err(|err| TransportError::Connect(format!("hello failed: {err}")))?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let inbound = events.clone();
        let (closed_tx, mut closed_rx) = oneshot::channel::<String>();
        let reader_task = tokio::spawn(async move {
            let mut reason = "broker closed the connection".to_string();
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BrokerFrame>(&text) {
                        Ok(BrokerFrame::Deliver { topic, payload }) => {
                            let _ = inbound.send(LinkEvent::Message {
                                topic,
                                payload: payload.into_bytes(),
                            });
                        }
                        Ok(BrokerFrame::Error(err)) => {
                            warn!(code = ?err.code, message = %err.message, "transport: broker reported error");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "transport: ignoring malformed broker frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        reason = format!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = closed_tx.send(reason);
        });

        // The writer owns the final `Closed` event so it can hand back every
        // publish it accepted but never wrote.
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<BrokerFrame>();
        tokio::spawn(async move {
            let mut failed = None;
            let reason = loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else {
                            break "connection handle dropped".to_string();
                        };
                        let message = match encode_frame(&frame) {
                            Ok(message) => message,
                            Err(reason) => {
                                warn!(%reason, "transport: dropping unencodable frame");
                                continue;
                            }
                        };
                        if let Err(err) = writer.send(message).await {
                            failed = Some(frame);
                            break format!("websocket send failed: {err}");
                        }
                        if matches!(frame, BrokerFrame::Goodbye) {
                            let _ = writer.send(Message::Close(None)).await;
                            break "closed by client".to_string();
                        }
                    }
                    reason = &mut closed_rx => {
                        break reason.unwrap_or_else(|_| "reader stopped".to_string());
                    }
                }
            };
            reader_task.abort();
            outbound_rx.close();
            let mut unsent = Vec::new();
            let leftover = std::iter::from_fn(|| outbound_rx.try_recv().ok());
            for frame in failed.into_iter().chain(leftover) {
                if let BrokerFrame::Publish {
                    topic,
                    payload,
                    retain,
                } = frame
                {
                    unsent.push(QueuedPublish {
                        topic,
                        payload: payload.into_bytes(),
                        retain,
                    });
                }
            }
            let _ = events.send(LinkEvent::Closed { reason, unsent });
        });

        Ok(LinkHandle {
            connection: Arc::new(WsConnection { outbound }),
            events: events_rx,
        })
    }
}

struct WsConnection {
    outbound: mpsc::UnboundedSender<BrokerFrame>,
}

impl WsConnection {
    fn send_frame(&self, frame: BrokerFrame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl BrokerConnection for WsConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send_frame(BrokerFrame::Subscribe {
            topic: topic.to_string(),
        })
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let payload = String::from_utf8(payload.to_vec()).map_err(|err| TransportError::Publish {
            topic: topic.to_string(),
            reason: format!("payload is not utf-8: {err}"),
        })?;
        self.send_frame(BrokerFrame::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.send_frame(BrokerFrame::Goodbye)
    }
}

fn encode_frame(frame: &BrokerFrame) -> Result<Message, String> {
    serde_json::to_string(frame)
        .map(Message::Text)
        .map_err(|err| format!("failed to encode broker frame: {err}"))
}

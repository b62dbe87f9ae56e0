use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{channel_connect_failed, CoreResult};

/// Close code for a deliberate, orderly shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Frames written by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Frames surfaced by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    /// The peer closed the channel; `code` is absent when no close frame arrived
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// An open channel; dropping `outbound` closes it
pub struct ChannelHandle {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens push channels, allowing the manager to be tested without sockets
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> CoreResult<ChannelHandle>;
}

/// tokio-tungstenite WebSocket transport
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> CoreResult<ChannelHandle> {
        let host = url.host_str().unwrap_or("").to_string();
        debug!(%host, "Opening WebSocket");

        let ws_stream = match timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(channel_connect_failed(e)),
            Err(_) => {
                return Err(channel_connect_failed(format!(
                    "handshake timed out after {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        };
        info!(%host, "WebSocket open");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<InboundFrame>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(OutboundFrame::Text(text)) => {
                            trace!(bytes = text.len(), "Sending text frame");
                            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                let _ = inbound_tx.send(InboundFrame::Error(e.to_string()));
                                break;
                            }
                        }
                        Some(OutboundFrame::Close { code, reason }) => {
                            debug!(code, "Closing WebSocket");
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = sink.send(WsMessage::Close(Some(frame))).await;
                            let _ = sink.close().await;
                            break;
                        }
                        None => {
                            // Manager dropped its handle
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    message = stream.next() => {
                        let frame = match message {
                            Some(Ok(WsMessage::Text(text))) => InboundFrame::Text(text.as_str().to_string()),
                            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => InboundFrame::Text(text),
                                Err(_) => {
                                    warn!("Ignoring non-UTF-8 binary frame");
                                    continue;
                                }
                            },
                            Some(Ok(WsMessage::Close(close))) => {
                                let (code, reason) = match close {
                                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                                    None => (None, String::new()),
                                };
                                let _ = inbound_tx.send(InboundFrame::Closed { code, reason });
                                break;
                            }
                            // Pings are answered by tungstenite itself
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = inbound_tx.send(InboundFrame::Error(e.to_string()));
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(InboundFrame::Closed {
                                    code: None,
                                    reason: "stream ended".to_string(),
                                });
                                break;
                            }
                        };
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("WebSocket pump stopped");
        });

        Ok(ChannelHandle { outbound, inbound })
    }
}

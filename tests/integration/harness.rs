//! Shared fixtures: a scriptable push server, signed-looking secrets and a
//! core wired to real transports
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crawldash_lib::connection::WebSocketTransport;
use crawldash_lib::{
    ConnectionState, CoreConfig, CoreEvent, EventKind, EventSubscriber, ReqwestHttpClient, SessionCore,
    StorageBackend,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// An access secret whose `exp` claim is `minutes` from now
pub fn access_secret(subject: &str, minutes: i64) -> String {
    let expires_at = Utc::now() + chrono::Duration::minutes(minutes);
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": subject, "exp": expires_at.timestamp() })
            .to_string()
            .as_bytes(),
    );
    format!("{}.{}.sig", header, claims)
}

pub fn test_config(api_url: &str, ws_url: &str) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.api.base_url = api_url.to_string();
    config.api.timeout_seconds = 5;
    config.channel.url = ws_url.to_string();
    config.channel.base_delay_ms = 20;
    config.channel.max_delay_ms = 100;
    config.channel.connect_timeout_seconds = 2;
    config
}

pub fn build_core(config: CoreConfig, backend: Arc<dyn StorageBackend>) -> SessionCore {
    let http = Arc::new(ReqwestHttpClient::new(config.api.timeout()).expect("http client"));
    let transport = Arc::new(WebSocketTransport::new(config.channel.connect_timeout()));
    SessionCore::with_parts(config, http, transport, backend)
}

pub async fn wait_for_state(subscriber: &mut EventSubscriber, state: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(CoreEvent::ConnectionStateChanged(snapshot)) = subscriber
                .recv_kind(&[EventKind::ConnectionStateChanged])
                .await
            {
                if snapshot.state == state {
                    return;
                }
            }
        }
    })
    .await
    .expect("connection state not reached in time")
}

/// Instructions for one accepted connection
pub enum ServerCommand {
    Text(String),
    /// Drop the socket without a closing handshake
    Drop,
}

/// One client connection as seen by the server
pub struct ServerConnection {
    /// Request path and query of the handshake
    pub uri: String,
    pub received: mpsc::UnboundedReceiver<String>,
    pub commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerConnection {
    pub fn token(&self) -> Option<String> {
        let url = url::Url::parse(&format!("ws://localhost{}", self.uri)).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    }

    pub fn send(&self, text: &str) {
        let _ = self.commands.send(ServerCommand::Text(text.to_string()));
    }

    pub fn drop_connection(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    /// Wait for the next text frame from the client
    pub async fn next_text(&mut self) -> String {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("no frame from client")
            .expect("connection gone")
    }
}

/// A local push server; every accepted connection is handed to the test
pub struct PushServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl PushServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind push server");
        let port = listener.local_addr().expect("local addr").port();
        let (connections_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connections_tx = connections_tx.clone();
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        uri = request.uri().to_string();
                        Ok(response)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                        return;
                    };

                    let (received_tx, received) = mpsc::unbounded_channel();
                    let (commands, mut commands_rx) = mpsc::unbounded_channel();
                    let _ = connections_tx.send(ServerConnection {
                        uri,
                        received,
                        commands,
                    });

                    loop {
                        tokio::select! {
                            command = commands_rx.recv() => match command {
                                Some(ServerCommand::Text(text)) => {
                                    if ws.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ServerCommand::Drop) | None => break,
                            },
                            message = ws.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text.as_str().to_string());
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{}/ws", port),
            connections,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection in time")
            .expect("server stopped")
    }
}

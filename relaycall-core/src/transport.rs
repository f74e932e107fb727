//! Relay connection implementations
//!
//! - [`WebSocketTransport`] talks to a relay server over a WebSocket, one JSON
//!   message per text frame.
//! - [`MemoryRelay`] is an in-process relay honoring the same contract: it
//!   assigns an identity to every client on connect and routes messages by
//!   their `to` field. Messages for unknown identities are dropped.

use crate::identity::PeerId;
use crate::signaling::{RelayMessage, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay WebSocket URL
    pub url: String,
    /// Limit for establishing the connection
    pub connect_timeout: Duration,
    /// Limit for the relay to push `identity-assigned` after connecting
    pub identity_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000".to_string(),
            connect_timeout: Duration::from_secs(10),
            identity_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Operation did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Connection closed
    #[error("Connection closed")]
    Closed,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay connection over a WebSocket
pub struct WebSocketTransport {
    url: String,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WsStream>>,
}

impl WebSocketTransport {
    /// Open the WebSocket
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails or exceeds the connect timeout
    #[tracing::instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let (ws, response) =
            tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(config.connect_timeout))?
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        tracing::info!(status = %response.status(), "Connected to relay");
        let (sink, stream) = ws.split();
        Ok(Self {
            url: config.url.clone(),
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
        })
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send_message(&self, message: RelayMessage) -> Result<(), TransportError> {
        let text = message
            .encode()
            .map_err(|e| TransportError::SendError(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))
    }

    async fn receive_message(&self) -> Result<Option<RelayMessage>, TransportError> {
        let mut stream = self.stream.lock().await;
        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| TransportError::ReceiveError(e.to_string()))?;
            let text = match frame {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(frame) => {
                    tracing::info!(?frame, "Relay sent close frame");
                    return Ok(None);
                }
                _ => continue,
            };
            match RelayMessage::decode(&text) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed relay frame"),
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

struct Route {
    serial: u64,
    inbox: mpsc::UnboundedSender<RelayMessage>,
}

#[derive(Default)]
struct RelayState {
    routes: Mutex<HashMap<PeerId, Route>>,
    next_serial: AtomicU64,
}

/// In-process relay
///
/// Cloning shares the same routing table.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client under a fresh random identity
    pub fn connect(&self) -> MemoryTransport {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.connect_as(format!("peer-{}", &id[..8]))
    }

    /// Connect a client under a chosen identity
    ///
    /// An existing client with the same identity is disconnected.
    pub fn connect_as(&self, id: impl Into<PeerId>) -> MemoryTransport {
        let transport = self.register(id.into());
        self.deliver(
            &transport.id,
            RelayMessage::IdentityAssigned {
                id: transport.id.clone(),
            },
        );
        transport
    }

    /// Connect a client that is routable but never told its identity
    ///
    /// Models a relay that stalls during the handshake.
    pub fn connect_without_identity(&self) -> MemoryTransport {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.register(PeerId::new(format!("silent-{}", &id[..8])))
    }

    /// Identities currently connected
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.routes.lock().keys().cloned().collect();
        peers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        peers
    }

    /// Push a message to a connected client as if it came from the relay
    ///
    /// Returns false if nobody with that identity is connected.
    pub fn deliver(&self, to: &PeerId, message: RelayMessage) -> bool {
        let routes = self.state.routes.lock();
        match routes.get(to) {
            Some(route) => route.inbox.send(message).is_ok(),
            None => false,
        }
    }

    fn register(&self, id: PeerId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let serial = self.state.next_serial.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .state
            .routes
            .lock()
            .insert(id.clone(), Route { serial, inbox: tx });
        if previous.is_some() {
            tracing::debug!(peer = %id, "Replacing existing memory relay client");
        }
        MemoryTransport {
            id,
            serial,
            relay: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    fn unregister(&self, id: &PeerId, serial: u64) {
        let mut routes = self.state.routes.lock();
        if routes.get(id).is_some_and(|route| route.serial == serial) {
            routes.remove(id);
            tracing::debug!(peer = %id, "Memory relay client left");
        }
    }
}

/// One client connection to a [`MemoryRelay`]
pub struct MemoryTransport {
    id: PeerId,
    serial: u64,
    relay: MemoryRelay,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
}

impl MemoryTransport {
    /// Identity this connection is routed under
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn send_message(&self, message: RelayMessage) -> Result<(), TransportError> {
        message
            .validate()
            .map_err(|e| TransportError::SendError(e.to_string()))?;
        let Some(target) = message.target().cloned() else {
            return Err(TransportError::SendError(
                "clients cannot assign identities".to_string(),
            ));
        };
        if !self.relay.deliver(&target, message) {
            tracing::debug!(to = %target, "Memory relay has no such client, message dropped");
        }
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<RelayMessage>, TransportError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.relay.unregister(&self.id, self.serial);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.relay.unregister(&self.id, self.serial);
    }
}

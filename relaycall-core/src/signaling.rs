//! Relay signaling protocol
//!
//! Defines the messages exchanged through the relay and [`RelayTransport`],
//! which owns one relay connection: it waits for the relay to assign an
//! identity, queues outbound messages, and hands each inbound message to the
//! handler registered for its kind.
//!
//! On the wire every message is a JSON object `{"event": <name>, "data": {..}}`.
//! The `signal` field is an opaque JSON value produced by the peer link; the
//! relay and this crate pass it through without looking inside.

use crate::identity::{IdentityError, LocalIdentity, PeerId};
use crate::transport::{TransportConfig, TransportError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Maximum encoded message size (64KB); SDP with all candidates fits easily
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum display name length
pub const MAX_DISPLAY_NAME_LENGTH: usize = 256;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Encoded message exceeds [`MAX_SIGNALING_MESSAGE_SIZE`]
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<IdentityError> for SignalingError {
    fn from(err: IdentityError) -> Self {
        SignalingError::InvalidMessage(err.to_string())
    }
}

/// Opaque negotiation payload produced by a peer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(Value);

impl Signal {
    /// Wrap a payload
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the payload
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Take the payload
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Whether there is no payload at all
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

/// Invite sent by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInvite {
    /// Callee
    pub to: PeerId,
    /// Caller
    pub from: PeerId,
    /// Caller display name, empty when unset
    #[serde(default)]
    pub name: String,
    /// Caller's offer
    pub signal: Signal,
}

/// Answer sent by the callee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAccept {
    /// Caller
    pub to: PeerId,
    /// Callee's answer
    pub signal: Signal,
    /// Callee, used to match the accept to the outstanding invite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    /// Callee display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Refusal of an invite (declined, busy or unanswered)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDecline {
    /// Caller
    pub to: PeerId,
    /// Callee
    pub from: PeerId,
    /// Free-form reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Hang-up or cancel from either side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHangup {
    /// Remote party
    pub to: PeerId,
    /// Sender
    pub from: PeerId,
    /// Free-form reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Relay message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Relay → client, once per connection
    IdentityAssigned {
        /// Assigned identity
        id: PeerId,
    },
    /// Caller → relay → callee
    CallInvite(CallInvite),
    /// Callee → relay → caller
    CallAccept(CallAccept),
    /// Callee → relay → caller
    CallDecline(CallDecline),
    /// Either side → relay → the other
    CallEnd(CallHangup),
}

/// Message kinds handlers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEventKind {
    /// `identity-assigned`
    IdentityAssigned,
    /// `call-invite`
    CallInvite,
    /// `call-accept`
    CallAccept,
    /// `call-decline`
    CallDecline,
    /// `call-end`
    CallEnd,
}

impl RelayEventKind {
    /// Wire name of the event
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityAssigned => "identity-assigned",
            Self::CallInvite => "call-invite",
            Self::CallAccept => "call-accept",
            Self::CallDecline => "call-decline",
            Self::CallEnd => "call-end",
        }
    }
}

impl fmt::Display for RelayEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelayMessage {
    /// Kind of this message
    #[must_use]
    pub fn kind(&self) -> RelayEventKind {
        match self {
            Self::IdentityAssigned { .. } => RelayEventKind::IdentityAssigned,
            Self::CallInvite(_) => RelayEventKind::CallInvite,
            Self::CallAccept(_) => RelayEventKind::CallAccept,
            Self::CallDecline(_) => RelayEventKind::CallDecline,
            Self::CallEnd(_) => RelayEventKind::CallEnd,
        }
    }

    /// Identity the relay should deliver this message to
    #[must_use]
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Self::IdentityAssigned { .. } => None,
            Self::CallInvite(m) => Some(&m.to),
            Self::CallAccept(m) => Some(&m.to),
            Self::CallDecline(m) => Some(&m.to),
            Self::CallEnd(m) => Some(&m.to),
        }
    }

    /// Check addressing fields and sizes
    ///
    /// The signal payload is only checked for presence.
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid field
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::IdentityAssigned { id } => id.validate()?,
            Self::CallInvite(m) => {
                m.to.validate()?;
                m.from.validate()?;
                validate_name(&m.name)?;
                validate_signal(&m.signal)?;
            }
            Self::CallAccept(m) => {
                m.to.validate()?;
                if let Some(from) = &m.from {
                    from.validate()?;
                }
                if let Some(name) = &m.name {
                    validate_name(name)?;
                }
                validate_signal(&m.signal)?;
            }
            Self::CallDecline(CallDecline { to, from, reason })
            | Self::CallEnd(CallHangup { to, from, reason }) => {
                to.validate()?;
                from.validate()?;
                if let Some(reason) = reason {
                    validate_name(reason)?;
                }
            }
        }
        Ok(())
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the message is invalid or too large
    pub fn encode(&self) -> Result<String, SignalingError> {
        self.validate()?;
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::MessageTooLarge {
                size: text.len(),
                max: MAX_SIGNALING_MESSAGE_SIZE,
            });
        }
        Ok(text)
    }

    /// Decode and validate a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is too large, not a known message, or invalid
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::MessageTooLarge {
                size: text.len(),
                max: MAX_SIGNALING_MESSAGE_SIZE,
            });
        }
        let message: Self = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }
}

fn validate_name(name: &str) -> Result<(), SignalingError> {
    if name.len() > MAX_DISPLAY_NAME_LENGTH {
        return Err(SignalingError::InvalidMessage(format!(
            "text field too long: {} bytes",
            name.len()
        )));
    }
    Ok(())
}

fn validate_signal(signal: &Signal) -> Result<(), SignalingError> {
    if signal.is_empty() {
        return Err(SignalingError::InvalidMessage(
            "signal payload is missing".to_string(),
        ));
    }
    Ok(())
}

/// A bidirectional connection to a relay
///
/// Implement this for the concrete channel (WebSocket, in-process, ...).
/// [`RelayTransport`] drives it from two tasks, so sending and receiving must
/// not block each other.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one message to the relay
    async fn send_message(&self, message: RelayMessage) -> Result<(), TransportError>;

    /// Receive the next message; `Ok(None)` once the connection is closed
    async fn receive_message(&self) -> Result<Option<RelayMessage>, TransportError>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Relay connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// `connect` not called yet
    Disconnected,
    /// Waiting for `identity-assigned`
    Connecting,
    /// Identity assigned; messages flow
    Ready,
    /// Connection lost or closed
    Closed,
}

/// Handler for one inbound message kind
pub type RelayHandler = Arc<dyn Fn(RelayMessage) + Send + Sync>;

struct RelayInner {
    transport: Arc<dyn SignalingTransport>,
    identity: LocalIdentity,
    handlers: RwLock<HashMap<RelayEventKind, RelayHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<RelayMessage>>>,
    status: watch::Sender<RelayStatus>,
}

impl RelayInner {
    fn dispatch(&self, message: RelayMessage) {
        if let RelayMessage::IdentityAssigned { id } = message {
            match self.identity.assign(id) {
                Ok(()) => {
                    tracing::info!(
                        identity = ?self.identity.get(),
                        "Relay assigned local identity"
                    );
                    self.status.send_replace(RelayStatus::Ready);
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring identity assignment"),
            }
            return;
        }

        let kind = message.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!(event = %kind, "No handler registered, dropping message"),
        }
    }
}

/// One persistent relay connection
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<RelayInner>,
    config: TransportConfig,
}

impl RelayTransport {
    /// Wrap a relay connection; nothing is read until [`connect`](Self::connect)
    pub fn new(transport: Arc<dyn SignalingTransport>, config: TransportConfig) -> Self {
        let (status, _) = watch::channel(RelayStatus::Disconnected);
        Self {
            inner: Arc::new(RelayInner {
                transport,
                identity: LocalIdentity::new(),
                handlers: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                status,
            }),
            config,
        }
    }

    /// Start reading and writing, and wait for the relay to assign an identity
    ///
    /// Handlers may be registered before or after connecting; messages that
    /// arrive for a kind with no handler are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if already connected, if the connection closes first, or
    /// if no identity arrives within the configured timeout
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<PeerId, TransportError> {
        {
            let current = *self.inner.status.borrow();
            if current != RelayStatus::Disconnected {
                return Err(TransportError::ConnectionError(format!(
                    "relay transport already used (status {current:?})"
                )));
            }
        }
        self.inner.status.send_replace(RelayStatus::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(outbound_tx);
        tokio::spawn(write_loop(self.inner.clone(), outbound_rx));
        tokio::spawn(read_loop(self.inner.clone()));

        let mut status = self.inner.status.subscribe();
        let waited = tokio::time::timeout(
            self.config.identity_timeout,
            status.wait_for(|s| matches!(s, RelayStatus::Ready | RelayStatus::Closed)),
        )
        .await;

        match waited {
            Ok(Ok(s)) if *s == RelayStatus::Ready => {}
            Ok(_) => return Err(TransportError::Closed),
            Err(_) => {
                tracing::warn!("Relay did not assign an identity in time");
                return Err(TransportError::Timeout(self.config.identity_timeout));
            }
        }

        self.inner
            .identity
            .get()
            .cloned()
            .ok_or(TransportError::Closed)
    }

    /// Queue a message for delivery
    ///
    /// Fire-and-forget: if the connection is down the message is dropped.
    pub fn send(&self, message: RelayMessage) {
        if !self.is_connected() {
            tracing::warn!(
                event = %message.kind(),
                "Relay unavailable, dropping outbound message"
            );
            return;
        }
        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::warn!("Relay writer stopped, message dropped");
                }
            }
            None => tracing::warn!("Relay writer missing, message dropped"),
        }
    }

    /// Register the handler for one message kind, replacing any previous one
    pub fn on_event<F>(&self, kind: RelayEventKind, handler: F)
    where
        F: Fn(RelayMessage) + Send + Sync + 'static,
    {
        let replaced = self
            .inner
            .handlers
            .write()
            .insert(kind, Arc::new(handler))
            .is_some();
        tracing::debug!(event = %kind, replaced, "Relay handler registered");
    }

    /// Identity assigned by the relay, once connected
    pub fn local_identity(&self) -> Option<PeerId> {
        self.inner.identity.get().cloned()
    }

    /// Whether messages can currently be sent
    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == RelayStatus::Ready
    }

    /// Current status
    pub fn status(&self) -> RelayStatus {
        *self.inner.status.borrow()
    }

    /// Observe status changes
    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status.subscribe()
    }

    /// Close the connection; later sends are dropped
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.status.send_replace(RelayStatus::Closed);
        self.inner.outbound.lock().take();
        if let Err(e) = self.inner.transport.close().await {
            tracing::debug!(error = %e, "Error while closing relay connection");
        }
    }
}

impl fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransport")
            .field("status", &self.status())
            .field("identity", &self.local_identity())
            .finish()
    }
}

async fn write_loop(inner: Arc<RelayInner>, mut outbound: mpsc::UnboundedReceiver<RelayMessage>) {
    while let Some(message) = outbound.recv().await {
        let kind = message.kind();
        let target = message.target().cloned();
        match inner.transport.send_message(message).await {
            Ok(()) => tracing::debug!(event = %kind, to = ?target, "Sent relay message"),
            Err(e) => tracing::warn!(event = %kind, error = %e, "Failed to send relay message"),
        }
    }
    tracing::debug!("Relay writer finished");
}

async fn read_loop(inner: Arc<RelayInner>) {
    loop {
        match inner.transport.receive_message().await {
            Ok(Some(message)) => {
                tracing::debug!(event = %message.kind(), "Received relay message");
                inner.dispatch(message);
            }
            Ok(None) => {
                tracing::info!("Relay connection closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay connection failed");
                break;
            }
        }
    }
    inner.status.send_replace(RelayStatus::Closed);
    inner.outbound.lock().take();
}

//! Peer link abstraction
//!
//! A peer link is the direct media connection negotiated through the relay.
//! Engines implement [`PeerLinkFactory`] and report progress through a
//! [`LinkEventSink`]; the call state machine only ever talks to a
//! [`PeerLinkAdapter`], which enforces the lifecycle rules every engine must
//! obey:
//!
//! - at most one `SignalReady` and one `RemoteStream` per link
//! - the remote signal is accepted exactly once
//! - `destroy` is idempotent, and an adapter dropped without it still gets
//!   its engine resources released
//!
//! [`LoopbackNetwork`] is an in-process engine used by tests and the demo.

use crate::media::MediaTrackSet;
use crate::signaling::Signal;
use crate::types::{CallRole, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of one link attempt, unique within a call engine
pub type LinkId = u64;

/// Peer link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The remote signal is malformed or does not fit this link
    #[error("Remote signal rejected: {0}")]
    SignalRejected(String),

    /// The engine failed
    #[error("Link failed: {0}")]
    Failed(String),

    /// The link was already destroyed
    #[error("Link destroyed")]
    Destroyed,

    /// A remote signal was already applied to this link
    #[error("Remote signal already applied")]
    AlreadySignaled,
}

/// Media received from the peer
#[derive(Debug, Clone)]
pub struct RemoteStream {
    /// Stream identifier announced by the peer
    pub id: String,
    /// Received tracks
    pub tracks: MediaTrackSet,
}

impl RemoteStream {
    /// Create a remote stream
    pub fn new(id: impl Into<String>, tracks: MediaTrackSet) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Whether the remote sends `kind`
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.has_kind(kind)
    }
}

/// Progress reported by a link engine
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Local negotiation payload to send to the peer
    SignalReady(Signal),
    /// Live remote media is available
    RemoteStream(RemoteStream),
    /// The link failed irrecoverably
    Failed(String),
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::SignalReady(_) => "signal-ready",
            Self::RemoteStream(_) => "remote-stream",
            Self::Failed(_) => "failed",
        }
    }
}

/// Channel end the call engine reads link events from
pub type LinkEventSender = mpsc::UnboundedSender<(LinkId, LinkEvent)>;

#[derive(Debug, Default)]
struct SinkGate {
    signal_sent: AtomicBool,
    stream_sent: AtomicBool,
}

/// Where an engine reports [`LinkEvent`]s
///
/// Every event is tagged with the link id. Only the first `SignalReady` and
/// the first `RemoteStream` are forwarded; repeats are logged and dropped.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    link_id: LinkId,
    tx: LinkEventSender,
    gate: Arc<SinkGate>,
}

impl LinkEventSink {
    /// Create a sink for link `link_id`
    pub fn new(link_id: LinkId, tx: LinkEventSender) -> Self {
        Self {
            link_id,
            tx,
            gate: Arc::new(SinkGate::default()),
        }
    }

    /// Link this sink belongs to
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Report the local negotiation payload
    pub fn signal_ready(&self, signal: Signal) {
        if self.gate.signal_sent.swap(true, Ordering::SeqCst) {
            tracing::debug!(link_id = self.link_id, "Extra signal from link dropped");
            return;
        }
        self.emit(LinkEvent::SignalReady(signal));
    }

    /// Report the remote stream
    pub fn remote_stream(&self, stream: RemoteStream) {
        if self.gate.stream_sent.swap(true, Ordering::SeqCst) {
            tracing::debug!(link_id = self.link_id, "Extra remote stream from link dropped");
            return;
        }
        self.emit(LinkEvent::RemoteStream(stream));
    }

    /// Report an irrecoverable failure
    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(LinkEvent::Failed(reason.into()));
    }

    fn emit(&self, event: LinkEvent) {
        let name = event.name();
        if self.tx.send((self.link_id, event)).is_err() {
            tracing::trace!(link_id = self.link_id, event = name, "Call engine gone, link event dropped");
        }
    }
}

/// One negotiated connection, as implemented by an engine
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Apply the peer's negotiation payload
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::SignalRejected`] for a payload this link cannot use
    async fn accept_remote_signal(&self, signal: Signal) -> Result<(), LinkError>;

    /// Release all resources; must tolerate repeated calls
    async fn destroy(&self);
}

/// Engine that creates peer links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a link attaching `tracks`
    ///
    /// A caller link starts negotiating immediately and reports its offer
    /// through `events`. A callee link waits for the remote signal.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot create the link
    async fn create(
        &self,
        role: CallRole,
        tracks: MediaTrackSet,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, LinkError>;
}

/// Owner of one engine link
pub struct PeerLinkAdapter {
    id: LinkId,
    role: CallRole,
    link: Arc<dyn PeerLink>,
    remote_applied: AtomicBool,
    destroyed: AtomicBool,
}

impl PeerLinkAdapter {
    /// Create a link through `factory`
    ///
    /// # Errors
    ///
    /// Returns the engine error if creation fails
    #[tracing::instrument(skip(factory, tracks, events), fields(stream_id = tracks.stream_id()))]
    pub async fn create(
        factory: &dyn PeerLinkFactory,
        id: LinkId,
        role: CallRole,
        tracks: MediaTrackSet,
        events: LinkEventSender,
    ) -> Result<Self, LinkError> {
        let sink = LinkEventSink::new(id, events);
        let link = factory.create(role, tracks, sink).await?;
        tracing::debug!(link_id = id, ?role, "Peer link created");
        Ok(Self {
            id,
            role,
            link: Arc::from(link),
            remote_applied: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Link id
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Role this link was created for
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Whether the remote signal has been applied
    pub fn has_remote_signal(&self) -> bool {
        self.remote_applied.load(Ordering::SeqCst)
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Apply the peer's signal; allowed once
    ///
    /// # Errors
    ///
    /// Returns error if the link is destroyed, already has a remote signal,
    /// or the engine rejects the payload
    pub async fn accept_remote_signal(&self, signal: Signal) -> Result<(), LinkError> {
        if self.is_destroyed() {
            return Err(LinkError::Destroyed);
        }
        if self.remote_applied.swap(true, Ordering::SeqCst) {
            tracing::warn!(link_id = self.id, "Second remote signal rejected");
            return Err(LinkError::AlreadySignaled);
        }
        self.link.accept_remote_signal(signal).await
    }

    /// Release the link
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link.destroy().await;
        tracing::debug!(link_id = self.id, "Peer link destroyed");
    }
}

impl std::fmt::Debug for PeerLinkAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLinkAdapter")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_applied", &self.has_remote_signal())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for PeerLinkAdapter {
    fn drop(&mut self) {
        if self.is_destroyed() {
            return;
        }
        tracing::error!(link_id = self.id, "Peer link dropped without destroy");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let link = self.link.clone();
                handle.spawn(async move { link.destroy().await });
            }
            Err(_) => tracing::error!(link_id = self.id, "No runtime to release leaked peer link"),
        }
    }
}

/// Negotiation payload exchanged by loopback links
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopbackSignal {
    #[serde(rename = "type")]
    kind: LoopbackSignalKind,
    session: String,
    #[serde(default)]
    tracks: Vec<MediaKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LoopbackSignalKind {
    Offer,
    Answer,
}

impl LoopbackSignal {
    fn parse(signal: &Signal, expected: LoopbackSignalKind) -> Result<Self, LinkError> {
        let parsed: Self = serde_json::from_value(signal.as_value().clone())
            .map_err(|e| LinkError::SignalRejected(format!("not a loopback signal: {e}")))?;
        if parsed.kind != expected {
            return Err(LinkError::SignalRejected(format!(
                "expected {expected:?}, got {:?}",
                parsed.kind
            )));
        }
        Ok(parsed)
    }

    fn to_signal(&self) -> Result<Signal, LinkError> {
        serde_json::to_value(self)
            .map(Signal::new)
            .map_err(|e| LinkError::Failed(e.to_string()))
    }
}

struct Endpoint {
    tracks: MediaTrackSet,
    events: LinkEventSink,
}

struct Session {
    caller: u64,
    callee: Option<u64>,
}

#[derive(Default)]
struct LoopbackState {
    endpoints: HashMap<u64, Endpoint>,
    sessions: HashMap<String, Session>,
}

#[derive(Default)]
struct LoopbackInner {
    state: Mutex<LoopbackState>,
    next_endpoint: AtomicU64,
    fail_next_create: AtomicBool,
    created: AtomicUsize,
}

/// In-process peer link engine
///
/// Both ends of a call must use the same network (or clones of it). The remote
/// stream each side receives shares the other side's [`MediaTrackSet`], so
/// toggling a track on one side is visible on the other. Destroying one end
/// does not notify the other; use [`break_all`](Self::break_all) to simulate
/// a network failure.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<LoopbackInner>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` fail
    pub fn fail_next_create(&self) {
        self.inner.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Report a failure on every live link
    pub fn break_all(&self, reason: &str) {
        let sinks: Vec<LinkEventSink> = self
            .inner
            .state
            .lock()
            .endpoints
            .values()
            .map(|e| e.events.clone())
            .collect();
        tracing::info!(links = sinks.len(), reason, "Breaking loopback links");
        for sink in sinks {
            sink.failed(reason);
        }
    }

    /// Number of links created and not yet destroyed
    pub fn live_links(&self) -> usize {
        self.inner.state.lock().endpoints.len()
    }

    /// Number of links ever created
    pub fn created_links(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("live_links", &self.live_links())
            .finish()
    }
}

#[async_trait]
impl PeerLinkFactory for LoopbackNetwork {
    async fn create(
        &self,
        role: CallRole,
        tracks: MediaTrackSet,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, LinkError> {
        if self.inner.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Failed("injected create failure".to_string()));
        }

        let endpoint = self.inner.next_endpoint.fetch_add(1, Ordering::SeqCst);
        let kinds: Vec<MediaKind> = tracks.tracks().iter().map(|t| t.kind()).collect();
        let offer = {
            let mut state = self.inner.state.lock();
            state.endpoints.insert(
                endpoint,
                Endpoint {
                    tracks,
                    events: events.clone(),
                },
            );
            match role {
                CallRole::Caller => {
                    let session = uuid::Uuid::new_v4().to_string();
                    state.sessions.insert(
                        session.clone(),
                        Session {
                            caller: endpoint,
                            callee: None,
                        },
                    );
                    Some(LoopbackSignal {
                        kind: LoopbackSignalKind::Offer,
                        session,
                        tracks: kinds,
                    })
                }
                CallRole::Callee => None,
            }
        };
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        let link = LoopbackLink {
            endpoint,
            role,
            session: Mutex::new(offer.as_ref().map(|o| o.session.clone())),
            network: self.inner.clone(),
        };
        if let Some(offer) = offer {
            events.signal_ready(offer.to_signal()?);
        }
        Ok(Box::new(link))
    }
}

struct LoopbackLink {
    endpoint: u64,
    role: CallRole,
    session: Mutex<Option<String>>,
    network: Arc<LoopbackInner>,
}

impl LoopbackLink {
    fn answer_offer(&self, offer: LoopbackSignal) -> Result<(), LinkError> {
        let (events, answer) = {
            let mut state = self.network.state.lock();
            let Some(own) = state.endpoints.get(&self.endpoint) else {
                return Err(LinkError::Destroyed);
            };
            let events = own.events.clone();
            let kinds = own.tracks.tracks().iter().map(|t| t.kind()).collect();
            let session = state
                .sessions
                .get_mut(&offer.session)
                .ok_or_else(|| LinkError::SignalRejected("unknown session".to_string()))?;
            if session.callee.is_some() {
                return Err(LinkError::SignalRejected("session already answered".to_string()));
            }
            session.callee = Some(self.endpoint);
            (
                events,
                LoopbackSignal {
                    kind: LoopbackSignalKind::Answer,
                    session: offer.session.clone(),
                    tracks: kinds,
                },
            )
        };
        *self.session.lock() = Some(offer.session);
        events.signal_ready(answer.to_signal()?);
        Ok(())
    }

    fn apply_answer(&self, answer: LoopbackSignal) -> Result<(), LinkError> {
        if self.session.lock().as_deref() != Some(answer.session.as_str()) {
            return Err(LinkError::SignalRejected(
                "answer is for another session".to_string(),
            ));
        }

        let (caller, callee) = {
            let state = self.network.state.lock();
            let session = state
                .sessions
                .get(&answer.session)
                .ok_or(LinkError::Destroyed)?;
            let callee_id = session
                .callee
                .ok_or_else(|| LinkError::SignalRejected("session not answered".to_string()))?;
            let caller = state.endpoints.get(&session.caller).ok_or(LinkError::Destroyed)?;
            let callee = state
                .endpoints
                .get(&callee_id)
                .ok_or_else(|| LinkError::SignalRejected("remote link is gone".to_string()))?;
            (
                (caller.events.clone(), caller.tracks.clone()),
                (callee.events.clone(), callee.tracks.clone()),
            )
        };

        let (caller_events, caller_tracks) = caller;
        let (callee_events, callee_tracks) = callee;
        caller_events.remote_stream(RemoteStream::new(
            callee_tracks.stream_id().to_string(),
            callee_tracks,
        ));
        callee_events.remote_stream(RemoteStream::new(
            caller_tracks.stream_id().to_string(),
            caller_tracks,
        ));
        Ok(())
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn accept_remote_signal(&self, signal: Signal) -> Result<(), LinkError> {
        match self.role {
            CallRole::Callee => {
                self.answer_offer(LoopbackSignal::parse(&signal, LoopbackSignalKind::Offer)?)
            }
            CallRole::Caller => {
                self.apply_answer(LoopbackSignal::parse(&signal, LoopbackSignalKind::Answer)?)
            }
        }
    }

    async fn destroy(&self) {
        let mut state = self.network.state.lock();
        state.endpoints.remove(&self.endpoint);
        if let Some(session) = self.session.lock().take() {
            match self.role {
                CallRole::Caller => {
                    state.sessions.remove(&session);
                }
                CallRole::Callee => {
                    if let Some(s) = state.sessions.get_mut(&session) {
                        s.callee = None;
                    }
                }
            }
        }
    }
}

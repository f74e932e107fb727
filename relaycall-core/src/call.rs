//! Call session state machine
//!
//! One call engine task owns the [`CallSession`] and the current
//! [`PeerLinkAdapter`]. User actions, relay messages and link events are all
//! funneled into that task and handled one at a time, so transitions never
//! interleave. [`CallManager`] is the cheap, cloneable handle to it.
//!
//! ```text
//!     Idle ──invite in──▶ Ringing ──answer──────┐
//!       │                   │ decline / timeout │
//!       │                   │ remote cancel     ▼
//!       │                   └──────▶ Idle   Negotiating ──remote stream──▶ Connected
//!       │                                       ▲    │                        │
//!       └──place_call───────────────────────────┘    │ hang-up, decline,      │
//!                                                    │ failure, bad signal    │
//!                                                    ▼                        │
//!                                                  Ended ◀────────────────────┘
//!                                                    │
//!                                                    ▼
//!                                                  Idle
//! ```

use crate::identity::PeerId;
use crate::media::{MediaControl, MediaTrackSet};
use crate::peer_link::{
    LinkError, LinkEvent, LinkEventSender, LinkId, PeerLinkAdapter, PeerLinkFactory, RemoteStream,
};
use crate::signaling::{
    CallAccept, CallDecline, CallHangup, CallInvite, RelayEventKind, RelayMessage, RelayTransport,
    Signal,
};
use crate::types::{CallEvent, CallId, CallRole, CallSession, CallSnapshot, CallState, EndReason};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Relay not connected
    #[error("Relay transport unavailable")]
    TransportUnavailable,

    /// No local media to send
    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    /// Remote signal malformed or not for this call
    #[error("Signal rejected: {0}")]
    SignalRejected(String),

    /// Peer link could not be created or failed
    #[error("Peer link failure: {0}")]
    LinkFailure(String),

    /// Action not allowed in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Bad call target
    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    /// Call engine stopped
    #[error("Call engine stopped")]
    Shutdown,
}

impl From<LinkError> for CallError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::SignalRejected(reason) => CallError::SignalRejected(reason),
            other => CallError::LinkFailure(other.to_string()),
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallManagerConfig {
    /// Name sent with invites and accepts
    pub display_name: Option<String>,
    /// Decline unanswered incoming calls after this long
    pub ring_timeout: Option<Duration>,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            ring_timeout: None,
            event_capacity: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    PlaceCall { target: PeerId, reply: Reply<CallId> },
    Answer { reply: Reply<()> },
    Decline { reply: Reply<()> },
    EndCall { reply: Reply<()> },
    SetDisplayName { name: Option<String> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Input {
    Command(Command),
    Relay(RelayMessage),
}

/// Handle to the call engine
///
/// Clones share the engine. The engine stops when [`shutdown`](Self::shutdown)
/// is called or the last handle is dropped; an active call is ended first.
#[derive(Clone)]
pub struct CallManager {
    inputs: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    relay: RelayTransport,
    violations: Arc<AtomicUsize>,
}

impl CallManager {
    /// Start the call engine
    ///
    /// Registers the call handlers on `relay`, replacing any registered
    /// before. Must be called from within a Tokio runtime.
    pub fn new(
        config: CallManagerConfig,
        relay: RelayTransport,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<MediaControl>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let session = CallSession::idle(config.display_name.clone());
        let (snapshot_tx, snapshot_rx) =
            watch::channel(CallSnapshot::from_session(&session, false, None));
        let violations = Arc::new(AtomicUsize::new(0));

        for kind in [
            RelayEventKind::CallInvite,
            RelayEventKind::CallAccept,
            RelayEventKind::CallDecline,
            RelayEventKind::CallEnd,
        ] {
            let inputs = input_tx.downgrade();
            relay.on_event(kind, move |message| {
                if let Some(inputs) = inputs.upgrade() {
                    let _ = inputs.send(Input::Relay(message));
                }
            });
        }

        let engine = CallEngine {
            config,
            relay: relay.clone(),
            links,
            media,
            session,
            link: None,
            remote_stream: None,
            next_link_id: 1,
            link_tx,
            ring_deadline: None,
            snapshot: snapshot_tx,
            events: events.clone(),
            violations: violations.clone(),
        };
        tokio::spawn(
            engine
                .run(input_rx, link_rx)
                .instrument(tracing::info_span!("call_engine")),
        );

        Self {
            inputs: input_tx,
            snapshot: snapshot_rx,
            events,
            relay,
            violations,
        }
    }

    /// Call `target`
    ///
    /// Returns once the peer link exists and the session is Negotiating; the
    /// invite goes out as soon as the link has produced its offer.
    ///
    /// # Errors
    ///
    /// Returns error if not Idle, the target is invalid, the relay is not
    /// connected, there is no local media, or the link cannot be created
    pub async fn place_call(&self, target: impl Into<PeerId>) -> Result<CallId, CallError> {
        let target = target.into();
        self.request(|reply| Command::PlaceCall { target, reply })
            .await
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if not Ringing, the relay is not connected, there is no
    /// local media, or negotiation fails immediately
    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if not Ringing
    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// Hang up, or cancel an outgoing call
    ///
    /// The peer link is destroyed before this returns.
    ///
    /// # Errors
    ///
    /// Returns error if not Negotiating or Connected
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Change the name sent with future invites and accepts
    pub fn set_display_name(&self, name: Option<String>) {
        let _ = self
            .inputs
            .send(Input::Command(Command::SetDisplayName { name }));
    }

    /// Stop the engine, ending any call in progress
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .inputs
            .send(Input::Command(Command::Shutdown { reply }))
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Current call snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    /// Observe snapshots
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Identity assigned by the relay
    pub fn local_identity(&self) -> Option<PeerId> {
        self.relay.local_identity()
    }

    /// Number of published snapshots that failed
    /// [`CallSnapshot::check_invariants`]; zero unless the engine has a bug
    pub fn invariant_violations(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(Input::Command(make(reply)))
            .map_err(|_| CallError::Shutdown)?;
        response.await.map_err(|_| CallError::Shutdown)?
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("CallManager")
            .field("state", &snapshot.state)
            .field("peer", &snapshot.peer)
            .finish()
    }
}

struct CallEngine {
    config: CallManagerConfig,
    relay: RelayTransport,
    links: Arc<dyn PeerLinkFactory>,
    media: Arc<MediaControl>,
    session: CallSession,
    link: Option<PeerLinkAdapter>,
    remote_stream: Option<RemoteStream>,
    next_link_id: LinkId,
    link_tx: LinkEventSender,
    ring_deadline: Option<Instant>,
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    violations: Arc<AtomicUsize>,
}

impl CallEngine {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut link_events: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
    ) {
        tracing::debug!("Call engine started");
        loop {
            let ring = self.ring_deadline;
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Command(Command::Shutdown { reply })) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(Input::Command(command)) => self.handle_command(command).await,
                    Some(Input::Relay(message)) => self.handle_relay(message).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some((link_id, event)) = link_events.recv() => {
                    self.handle_link_event(link_id, event).await;
                }
                () = sleep_until(ring), if ring.is_some() => self.ring_timed_out(),
            }
        }
        tracing::debug!("Call engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaceCall { target, reply } => {
                let result = self.place_call(target).await;
                let _ = reply.send(self.report(result));
            }
            Command::Answer { reply } => {
                let result = self.answer().await;
                let _ = reply.send(self.report(result));
            }
            Command::Decline { reply } => {
                let _ = reply.send(self.decline());
            }
            Command::EndCall { reply } => {
                let result = match self.session.state {
                    CallState::Negotiating | CallState::Connected => {
                        self.end_active(EndReason::LocalHangup, Some("hangup")).await;
                        Ok(())
                    }
                    state => Err(CallError::InvalidState(state)),
                };
                let _ = reply.send(result);
            }
            Command::SetDisplayName { name } => {
                self.config.display_name.clone_from(&name);
                self.session.local_display_name = name;
                self.publish();
            }
            Command::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
        }
    }

    /// Surface recoverable errors as events as well as to the caller
    fn report<T>(&self, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(
            error @ (CallError::TransportUnavailable | CallError::MediaUnavailable(_)),
        ) = &result
        {
            tracing::warn!(%error, "Call action unavailable");
            self.emit(CallEvent::Unavailable {
                error: error.clone(),
            });
        }
        result
    }

    #[tracing::instrument(skip(self, target), fields(to = %target))]
    async fn place_call(&mut self, target: PeerId) -> Result<CallId, CallError> {
        if self.session.state != CallState::Idle {
            return Err(CallError::InvalidState(self.session.state));
        }
        target
            .validate()
            .map_err(|e| CallError::InvalidTarget(e.to_string()))?;
        if self.relay.local_identity().as_ref() == Some(&target) {
            return Err(CallError::InvalidTarget("cannot call yourself".to_string()));
        }
        if !self.relay.is_connected() {
            return Err(CallError::TransportUnavailable);
        }
        let tracks = self.local_tracks()?;

        let link = self.create_link(CallRole::Caller, tracks).await?;
        self.session = CallSession::outgoing(self.config.display_name.clone(), target.clone());
        self.link = Some(link);
        let call_id = self.session.call_id;
        tracing::info!(call_id = %call_id, "Placing call");
        self.emit(CallEvent::CallPlaced {
            call_id,
            to: target,
        });
        self.announce_state(CallState::Idle);
        Ok(call_id)
    }

    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    async fn answer(&mut self) -> Result<(), CallError> {
        if self.session.state != CallState::Ringing {
            return Err(CallError::InvalidState(self.session.state));
        }
        if !self.relay.is_connected() {
            return Err(CallError::TransportUnavailable);
        }
        let tracks = self.local_tracks()?;
        let Some(offer) = self.session.pending_remote_signal.clone() else {
            return Err(CallError::InvalidState(self.session.state));
        };
        self.ring_deadline = None;

        let link = match self.create_link(CallRole::Callee, tracks).await {
            Ok(link) => link,
            Err(e) => {
                self.end_active(EndReason::LinkFailure(e.to_string()), Some("link failure"))
                    .await;
                return Err(e);
            }
        };
        let accepted = link.accept_remote_signal(offer).await;
        self.link = Some(link);
        self.session.pending_remote_signal = None;
        self.set_state(CallState::Negotiating);

        if let Err(e) = accepted {
            tracing::warn!(error = %e, "Caller's offer rejected");
            let error = CallError::from(e);
            let reason = match &error {
                CallError::SignalRejected(r) => EndReason::SignalRejected(r.clone()),
                other => EndReason::LinkFailure(other.to_string()),
            };
            self.end_active(reason, Some("signal rejected")).await;
            return Err(error);
        }
        Ok(())
    }

    fn decline(&mut self) -> Result<(), CallError> {
        if self.session.state != CallState::Ringing {
            return Err(CallError::InvalidState(self.session.state));
        }
        self.send_decline("declined");
        self.clear_ringing(EndReason::Declined);
        Ok(())
    }

    fn ring_timed_out(&mut self) {
        self.ring_deadline = None;
        if self.session.state != CallState::Ringing {
            return;
        }
        tracing::info!(call_id = %self.session.call_id, "Incoming call not answered in time");
        self.send_decline("timeout");
        self.clear_ringing(EndReason::Timeout);
    }

    async fn stop(&mut self) {
        match self.session.state {
            CallState::Negotiating | CallState::Connected => {
                self.end_active(EndReason::Shutdown, Some("shutdown")).await;
            }
            CallState::Ringing => {
                self.send_decline("unavailable");
                self.clear_ringing(EndReason::Shutdown);
            }
            CallState::Idle | CallState::Ended => {}
        }
    }

    async fn handle_relay(&mut self, message: RelayMessage) {
        let Some(me) = self.relay.local_identity() else {
            tracing::warn!(event = %message.kind(), "Relay message before identity assignment");
            return;
        };
        if message.target() != Some(&me) {
            tracing::warn!(event = %message.kind(), to = ?message.target(), "Relay message for another identity");
            return;
        }

        match message {
            RelayMessage::CallInvite(invite) => self.on_invite(invite, me),
            RelayMessage::CallAccept(accept) => self.on_accept(accept).await,
            RelayMessage::CallDecline(decline) => self.on_decline(decline).await,
            RelayMessage::CallEnd(hangup) => self.on_hangup(hangup).await,
            RelayMessage::IdentityAssigned { .. } => {}
        }
    }

    fn on_invite(&mut self, invite: CallInvite, me: PeerId) {
        if invite.from == me {
            tracing::warn!("Ignoring invite from ourselves");
            return;
        }
        match self.session.state {
            CallState::Idle => {
                let name = Some(invite.name).filter(|n| !n.is_empty());
                self.session = CallSession::incoming(
                    self.config.display_name.clone(),
                    invite.from.clone(),
                    name.clone(),
                    invite.signal,
                );
                self.ring_deadline = self.config.ring_timeout.map(|t| Instant::now() + t);
                tracing::info!(
                    call_id = %self.session.call_id,
                    from = %invite.from,
                    name = name.as_deref().unwrap_or(""),
                    "Incoming call"
                );
                self.emit(CallEvent::IncomingCall {
                    call_id: self.session.call_id,
                    from: invite.from,
                    name,
                });
                self.announce_state(CallState::Idle);
            }
            CallState::Ringing if self.session.is_peer(&invite.from) => {
                tracing::debug!(from = %invite.from, "Duplicate invite ignored");
            }
            state => {
                tracing::info!(from = %invite.from, ?state, "Busy, declining invite");
                self.relay.send(RelayMessage::CallDecline(CallDecline {
                    to: invite.from,
                    from: me,
                    reason: Some("busy".to_string()),
                }));
            }
        }
    }

    async fn on_accept(&mut self, accept: CallAccept) {
        if self.session.state != CallState::Negotiating
            || self.session.role != Some(CallRole::Caller)
        {
            tracing::warn!(state = ?self.session.state, "Unexpected call-accept ignored");
            return;
        }
        if let Some(from) = &accept.from {
            if !self.session.is_peer(from) {
                tracing::warn!(from = %from, peer = ?self.session.peer, "Accept from unexpected peer ignored");
                return;
            }
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if link.has_remote_signal() {
            tracing::warn!("Duplicate call-accept ignored");
            return;
        }

        if let Some(name) = accept.name.filter(|n| !n.is_empty()) {
            self.session.remote_display_name = Some(name);
            self.publish();
        }
        if let Err(e) = link.accept_remote_signal(accept.signal).await {
            tracing::warn!(error = %e, "Callee's answer rejected");
            let reason = match CallError::from(e) {
                CallError::SignalRejected(r) => EndReason::SignalRejected(r),
                other => EndReason::LinkFailure(other.to_string()),
            };
            self.end_active(reason, Some("signal rejected")).await;
        }
    }

    async fn on_decline(&mut self, decline: CallDecline) {
        if self.session.state == CallState::Negotiating
            && self.session.role == Some(CallRole::Caller)
            && self.session.is_peer(&decline.from)
        {
            tracing::info!(reason = ?decline.reason, "Call declined by peer");
            self.end_active(EndReason::RemoteDeclined(decline.reason), None)
                .await;
        } else {
            tracing::debug!(from = %decline.from, "Stale call-decline ignored");
        }
    }

    async fn on_hangup(&mut self, hangup: CallHangup) {
        if !self.session.is_peer(&hangup.from) {
            tracing::debug!(from = %hangup.from, "call-end from unrelated peer ignored");
            return;
        }
        match self.session.state {
            CallState::Ringing => {
                tracing::info!("Caller cancelled before answer");
                self.clear_ringing(EndReason::RemoteHangup);
            }
            CallState::Negotiating | CallState::Connected => {
                tracing::info!(reason = ?hangup.reason, "Peer hung up");
                self.end_active(EndReason::RemoteHangup, None).await;
            }
            CallState::Idle | CallState::Ended => {}
        }
    }

    async fn handle_link_event(&mut self, link_id: LinkId, event: LinkEvent) {
        if self.link.as_ref().map(PeerLinkAdapter::id) != Some(link_id) {
            tracing::debug!(link_id, "Event from stale link ignored");
            return;
        }
        match event {
            LinkEvent::SignalReady(signal) => self.send_local_signal(signal),
            LinkEvent::RemoteStream(stream) => {
                if self.session.state != CallState::Negotiating {
                    return;
                }
                tracing::info!(call_id = %self.session.call_id, stream_id = %stream.id, "Call connected");
                self.session.connected_at = Some(chrono::Utc::now());
                self.remote_stream = Some(stream.clone());
                self.set_state(CallState::Connected);
                self.emit(CallEvent::RemoteStream {
                    call_id: self.session.call_id,
                    stream,
                });
            }
            LinkEvent::Failed(reason) => {
                if self.session.state.has_link() {
                    tracing::warn!(%reason, "Peer link failed");
                    self.end_active(EndReason::LinkFailure(reason), Some("link failure"))
                        .await;
                }
            }
        }
    }

    fn send_local_signal(&self, signal: Signal) {
        let (Some(peer), Some(me)) = (self.session.peer.clone(), self.relay.local_identity())
        else {
            return;
        };
        let name = self.session.local_display_name.clone();
        let message = match self.session.role {
            Some(CallRole::Caller) => RelayMessage::CallInvite(CallInvite {
                to: peer,
                from: me,
                name: name.unwrap_or_default(),
                signal,
            }),
            Some(CallRole::Callee) => RelayMessage::CallAccept(CallAccept {
                to: peer,
                signal,
                from: Some(me),
                name,
            }),
            None => return,
        };
        tracing::debug!(event = %message.kind(), "Sending local signal");
        self.relay.send(message);
    }

    /// Tear down the current call; the link, if any, is destroyed before
    /// Ended is published
    async fn end_active(&mut self, reason: EndReason, notify_peer: Option<&str>) {
        if let Some(link) = self.link.take() {
            link.destroy().await;
        }
        self.remote_stream = None;
        self.ring_deadline = None;
        if let Some(text) = notify_peer {
            self.send_hangup(text);
        }

        let duration = self.session.duration();
        self.session.pending_remote_signal = None;
        self.set_state(CallState::Ended);
        tracing::info!(
            call_id = %self.session.call_id,
            ?reason,
            duration_secs = duration.map(|d| d.num_seconds()),
            "Call ended"
        );
        self.emit(CallEvent::CallEnded {
            call_id: self.session.call_id,
            reason,
            duration,
        });
        self.reset();
    }

    fn clear_ringing(&mut self, reason: EndReason) {
        self.ring_deadline = None;
        self.emit(CallEvent::CallEnded {
            call_id: self.session.call_id,
            reason,
            duration: None,
        });
        self.reset();
    }

    fn reset(&mut self) {
        let previous = self.session.state;
        self.session = CallSession::idle(self.config.display_name.clone());
        self.announce_state(previous);
    }

    fn send_decline(&self, reason: &str) {
        if let (Some(peer), Some(me)) = (self.session.peer.clone(), self.relay.local_identity()) {
            self.relay.send(RelayMessage::CallDecline(CallDecline {
                to: peer,
                from: me,
                reason: Some(reason.to_string()),
            }));
        }
    }

    fn send_hangup(&self, reason: &str) {
        if let (Some(peer), Some(me)) = (self.session.peer.clone(), self.relay.local_identity()) {
            self.relay.send(RelayMessage::CallEnd(CallHangup {
                to: peer,
                from: me,
                reason: Some(reason.to_string()),
            }));
        }
    }

    fn local_tracks(&self) -> Result<MediaTrackSet, CallError> {
        self.media
            .tracks()
            .filter(|set| !set.is_empty())
            .ok_or_else(|| CallError::MediaUnavailable("no local media acquired".to_string()))
    }

    async fn create_link(
        &mut self,
        role: CallRole,
        tracks: MediaTrackSet,
    ) -> Result<PeerLinkAdapter, CallError> {
        let id = self.next_link_id;
        self.next_link_id += 1;
        PeerLinkAdapter::create(self.links.as_ref(), id, role, tracks, self.link_tx.clone())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Failed to create peer link");
                CallError::LinkFailure(e.to_string())
            })
    }

    fn set_state(&mut self, state: CallState) {
        let previous = self.session.state;
        self.session.state = state;
        self.announce_state(previous);
    }

    fn announce_state(&mut self, previous: CallState) {
        let state = self.session.state;
        tracing::debug!(
            call_id = %self.session.call_id,
            old_state = ?previous,
            new_state = ?state,
            "Call state transition"
        );
        self.publish();
        self.emit(CallEvent::StateChanged {
            call_id: self.session.call_id,
            state,
        });
    }

    fn publish(&self) {
        let snapshot = CallSnapshot::from_session(
            &self.session,
            self.link.is_some(),
            self.remote_stream.clone(),
        );
        if let Err(violation) = snapshot.check_invariants() {
            tracing::error!(%violation, "Call snapshot violates session invariants");
            self.violations.fetch_add(1, Ordering::Relaxed);
        }
        self.snapshot.send_replace(snapshot);
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

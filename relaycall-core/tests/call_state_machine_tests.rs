//! Call state machine tests
//!
//! One side is a real [`CallManager`]; the other is scripted directly on a
//! memory relay connection so every message can be inspected or forged.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use relaycall_core::{
    CallAccept, CallDecline, CallError, CallEvent, CallHangup, CallInvite, CallManager,
    CallManagerConfig, CallRole, CallSnapshot, CallState, EndReason, LinkError, LinkEvent, LinkId,
    LinkEventSink, LocalMediaSource, LoopbackNetwork, MediaConstraints, MediaControl, MediaTrackSet,
    MemoryRelay, MemoryTransport, PeerId, PeerLink, PeerLinkAdapter, PeerLinkFactory, RelayMessage,
    RelayTransport, Signal, SignalingTransport, SyntheticMediaSource, TransportConfig,
};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Client {
    manager: CallManager,
    media: Arc<MediaControl>,
    events: broadcast::Receiver<CallEvent>,
}

impl Client {
    async fn start(
        relay: &MemoryRelay,
        id: &str,
        links: Arc<dyn PeerLinkFactory>,
        config: CallManagerConfig,
        with_media: bool,
    ) -> Self {
        let transport =
            RelayTransport::new(Arc::new(relay.connect_as(id)), TransportConfig::default());
        let media = Arc::new(MediaControl::new());
        if with_media {
            media.attach(local_tracks().await).unwrap();
        }
        let manager = CallManager::new(config, transport.clone(), links, media.clone());
        transport.connect().await.unwrap();
        let events = manager.subscribe_events();
        Self {
            manager,
            media,
            events,
        }
    }

    async fn alice(relay: &MemoryRelay, network: &LoopbackNetwork) -> Self {
        Self::start(
            relay,
            "a1",
            Arc::new(network.clone()),
            named("Alice"),
            true,
        )
        .await
    }

    async fn wait_state(&self, state: CallState) -> CallSnapshot {
        let mut rx = self.manager.watch();
        let snapshot = timeout(WAIT, rx.wait_for(|s| s.state == state))
            .await
            .unwrap()
            .unwrap()
            .clone();
        snapshot
    }

    async fn next_event(&mut self, mut pred: impl FnMut(&CallEvent) -> bool) -> CallEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn ended(&mut self) -> EndReason {
        match self
            .next_event(|e| matches!(e, CallEvent::CallEnded { .. }))
            .await
        {
            CallEvent::CallEnded { reason, .. } => reason,
            _ => unreachable!(),
        }
    }

    async fn finish(self) {
        self.manager.shutdown().await;
        assert_eq!(self.manager.invariant_violations(), 0);
    }
}

fn named(name: &str) -> CallManagerConfig {
    CallManagerConfig {
        display_name: Some(name.to_string()),
        ..CallManagerConfig::default()
    }
}

async fn local_tracks() -> MediaTrackSet {
    SyntheticMediaSource::new()
        .acquire(&MediaConstraints::video_call())
        .await
        .unwrap()
}

/// A relay client driven by hand
struct Remote {
    id: PeerId,
    conn: MemoryTransport,
}

impl Remote {
    async fn join(relay: &MemoryRelay, id: &str) -> Self {
        let remote = Self {
            id: PeerId::new(id),
            conn: relay.connect_as(id),
        };
        assert_eq!(
            remote.recv().await,
            RelayMessage::IdentityAssigned {
                id: PeerId::new(id)
            }
        );
        remote
    }

    async fn recv(&self) -> RelayMessage {
        timeout(WAIT, self.conn.receive_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn expect_silence(&self) {
        let received = timeout(Duration::from_millis(100), self.conn.receive_message()).await;
        assert!(received.is_err(), "unexpected message: {received:?}");
    }

    async fn send(&self, message: RelayMessage) {
        self.conn.send_message(message).await.unwrap();
    }

    async fn invite(&self, to: &str, name: &str, signal: Signal) {
        self.send(RelayMessage::CallInvite(CallInvite {
            to: PeerId::new(to),
            from: self.id.clone(),
            name: name.to_string(),
            signal,
        }))
        .await;
    }

    async fn accept(&self, to: &str, signal: Signal) {
        self.send(RelayMessage::CallAccept(CallAccept {
            to: PeerId::new(to),
            signal,
            from: Some(self.id.clone()),
            name: Some("Bob".to_string()),
        }))
        .await;
    }

    /// Accept carrying only the fields a minimal relay client sends
    async fn accept_bare(&self, to: &str, signal: Signal) {
        self.send(RelayMessage::CallAccept(CallAccept {
            to: PeerId::new(to),
            signal,
            from: None,
            name: None,
        }))
        .await;
    }

    async fn hang_up(&self, to: &str) {
        self.send(RelayMessage::CallEnd(CallHangup {
            to: PeerId::new(to),
            from: self.id.clone(),
            reason: None,
        }))
        .await;
    }

    async fn expect_invite(&self) -> CallInvite {
        match self.recv().await {
            RelayMessage::CallInvite(invite) => invite,
            other => panic!("expected invite, got {other:?}"),
        }
    }
}

/// Answer `offer` with a loopback callee link, as a remote client would
async fn loopback_answer(
    network: &LoopbackNetwork,
    offer: Signal,
) -> (
    PeerLinkAdapter,
    Signal,
    mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = PeerLinkAdapter::create(network, 99, CallRole::Callee, local_tracks().await, tx)
        .await
        .unwrap();
    link.accept_remote_signal(offer).await.unwrap();
    let answer = match timeout(WAIT, rx.recv()).await.unwrap().unwrap().1 {
        LinkEvent::SignalReady(signal) => signal,
        other => panic!("expected answer, got {other:?}"),
    };
    (link, answer, rx)
}

fn offer_placeholder() -> Signal {
    Signal::new(json!({"type": "offer", "session": "not-a-session"}))
}

#[tokio::test]
async fn place_call_sends_invite_with_link_offer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    let call_id = alice.manager.place_call("b2").await.unwrap();
    let snapshot = alice.manager.snapshot();
    assert_eq!(snapshot.call_id, call_id);
    assert_eq!(snapshot.state, CallState::Negotiating);
    assert_eq!(snapshot.role, Some(CallRole::Caller));
    assert_eq!(snapshot.peer, Some(PeerId::new("b2")));
    assert!(snapshot.has_link);
    assert!(matches!(
        alice.next_event(|e| matches!(e, CallEvent::CallPlaced { .. })).await,
        CallEvent::CallPlaced { to, .. } if to == PeerId::new("b2")
    ));

    let invite = bob.expect_invite().await;
    assert_eq!(invite.from, PeerId::new("a1"));
    assert_eq!(invite.to, PeerId::new("b2"));
    assert_eq!(invite.name, "Alice");
    assert_eq!(invite.signal.as_value()["type"], "offer");
    bob.expect_silence().await;

    alice.finish().await;
}

#[tokio::test]
async fn place_call_rejects_bad_targets_and_states() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let _bob = Remote::join(&relay, "b2").await;

    assert!(matches!(
        alice.manager.place_call("").await,
        Err(CallError::InvalidTarget(_))
    ));
    assert!(matches!(
        alice.manager.place_call("a1").await,
        Err(CallError::InvalidTarget(_))
    ));
    assert_eq!(alice.manager.state(), CallState::Idle);

    alice.manager.place_call("b2").await.unwrap();
    assert_eq!(
        alice.manager.place_call("b2").await,
        Err(CallError::InvalidState(CallState::Negotiating))
    );
    assert_eq!(
        alice.manager.answer().await,
        Err(CallError::InvalidState(CallState::Negotiating))
    );
    assert_eq!(
        alice.manager.decline().await,
        Err(CallError::InvalidState(CallState::Negotiating))
    );
    assert_eq!(network.created_links(), 1);

    alice.finish().await;
}

#[tokio::test]
async fn actions_in_idle_are_invalid() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;

    assert_eq!(
        alice.manager.end_call().await,
        Err(CallError::InvalidState(CallState::Idle))
    );
    assert_eq!(
        alice.manager.answer().await,
        Err(CallError::InvalidState(CallState::Idle))
    );
    assert_eq!(
        alice.manager.decline().await,
        Err(CallError::InvalidState(CallState::Idle))
    );
    assert_eq!(alice.manager.state(), CallState::Idle);

    alice.finish().await;
}

#[tokio::test]
async fn place_call_without_media_reports_unavailable() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::start(
        &relay,
        "a1",
        Arc::new(network.clone()),
        CallManagerConfig::default(),
        false,
    )
    .await;
    let _bob = Remote::join(&relay, "b2").await;

    let result = alice.manager.place_call("b2").await;
    assert!(matches!(result, Err(CallError::MediaUnavailable(_))));
    assert!(matches!(
        alice
            .next_event(|e| matches!(e, CallEvent::Unavailable { .. }))
            .await,
        CallEvent::Unavailable {
            error: CallError::MediaUnavailable(_)
        }
    ));
    assert_eq!(alice.manager.state(), CallState::Idle);
    assert_eq!(network.created_links(), 0);

    alice.finish().await;
}

#[tokio::test]
async fn place_call_without_relay_reports_unavailable() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let transport =
        RelayTransport::new(Arc::new(relay.connect_as("a1")), TransportConfig::default());
    let media = Arc::new(MediaControl::new());
    media.attach(local_tracks().await).unwrap();
    let manager = CallManager::new(
        CallManagerConfig::default(),
        transport,
        Arc::new(network.clone()),
        media,
    );

    assert_eq!(
        manager.place_call("b2").await,
        Err(CallError::TransportUnavailable)
    );
    assert_eq!(manager.state(), CallState::Idle);
    manager.shutdown().await;
    assert_eq!(manager.place_call("b2").await, Err(CallError::Shutdown));
}

#[tokio::test]
async fn link_creation_failure_leaves_session_idle() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    network.fail_next_create();
    assert!(matches!(
        alice.manager.place_call("b2").await,
        Err(CallError::LinkFailure(_))
    ));
    assert_eq!(alice.manager.state(), CallState::Idle);
    bob.expect_silence().await;

    alice.finish().await;
}

#[tokio::test]
async fn incoming_invite_rings_with_caller_name() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", offer_placeholder()).await;
    let event = alice
        .next_event(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    assert!(matches!(
        event,
        CallEvent::IncomingCall { ref from, ref name, .. }
            if from == &PeerId::new("b2") && name.as_deref() == Some("Bob")
    ));

    let snapshot = alice.wait_state(CallState::Ringing).await;
    assert_eq!(snapshot.role, Some(CallRole::Callee));
    assert_eq!(snapshot.peer, Some(PeerId::new("b2")));
    assert_eq!(snapshot.remote_display_name.as_deref(), Some("Bob"));
    assert!(snapshot.has_pending_signal);
    assert!(!snapshot.has_link);

    // A repeated invite from the same caller changes nothing
    bob.invite("a1", "Bob", offer_placeholder()).await;
    bob.expect_silence().await;
    assert_eq!(alice.manager.state(), CallState::Ringing);
    assert_eq!(network.created_links(), 0);

    alice.finish().await;
}

#[tokio::test]
async fn invite_while_busy_is_declined_without_state_change() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;
    let carol = Remote::join(&relay, "c3").await;

    alice.manager.place_call("b2").await.unwrap();
    let _ = bob.expect_invite().await;
    let before = alice.manager.snapshot();

    carol.invite("a1", "Carol", offer_placeholder()).await;
    assert_eq!(
        carol.recv().await,
        RelayMessage::CallDecline(CallDecline {
            to: PeerId::new("c3"),
            from: PeerId::new("a1"),
            reason: Some("busy".to_string()),
        })
    );

    let after = alice.manager.snapshot();
    assert_eq!(after.call_id, before.call_id);
    assert_eq!(after.state, CallState::Negotiating);
    assert_eq!(after.peer, Some(PeerId::new("b2")));
    assert!(after.has_link);

    alice.finish().await;
}

#[tokio::test]
async fn decline_clears_session_and_notifies_caller() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", offer_placeholder()).await;
    alice.wait_state(CallState::Ringing).await;

    alice.manager.decline().await.unwrap();
    let snapshot = alice.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Idle);
    assert!(snapshot.peer.is_none());
    assert!(!snapshot.has_pending_signal);
    assert!(snapshot.remote_display_name.is_none());

    assert_eq!(alice.ended().await, EndReason::Declined);
    assert_eq!(
        bob.recv().await,
        RelayMessage::CallDecline(CallDecline {
            to: PeerId::new("b2"),
            from: PeerId::new("a1"),
            reason: Some("declined".to_string()),
        })
    );
    assert_eq!(network.created_links(), 0);

    alice.finish().await;
}

#[tokio::test]
async fn caller_cancel_while_ringing_returns_to_idle() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", offer_placeholder()).await;
    alice.wait_state(CallState::Ringing).await;

    bob.hang_up("a1").await;
    assert_eq!(alice.ended().await, EndReason::RemoteHangup);
    let snapshot = alice.wait_state(CallState::Idle).await;
    assert!(snapshot.peer.is_none());
    bob.expect_silence().await;

    alice.finish().await;
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let config = CallManagerConfig {
        ring_timeout: Some(Duration::from_millis(50)),
        ..named("Alice")
    };
    let mut alice = Client::start(&relay, "a1", Arc::new(network.clone()), config, true).await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", offer_placeholder()).await;
    assert_eq!(alice.ended().await, EndReason::Timeout);
    assert_eq!(alice.manager.state(), CallState::Idle);
    assert!(matches!(
        bob.recv().await,
        RelayMessage::CallDecline(CallDecline { reason: Some(ref r), .. }) if r == "timeout"
    ));

    alice.finish().await;
}

#[tokio::test]
async fn answer_without_media_keeps_ringing() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::start(
        &relay,
        "a1",
        Arc::new(network.clone()),
        CallManagerConfig::default(),
        false,
    )
    .await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", offer_placeholder()).await;
    alice.wait_state(CallState::Ringing).await;

    assert!(matches!(
        alice.manager.answer().await,
        Err(CallError::MediaUnavailable(_))
    ));
    let snapshot = alice.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert!(snapshot.has_pending_signal);

    // Media arrives late; answering now gets past the media check
    alice.media.attach(local_tracks().await).unwrap();
    assert!(matches!(
        alice.manager.answer().await,
        Err(CallError::SignalRejected(_))
    ));

    alice.finish().await;
}

#[tokio::test]
async fn malformed_offer_ends_call_on_answer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    bob.invite("a1", "Bob", Signal::new(json!("garbage"))).await;
    alice.wait_state(CallState::Ringing).await;

    assert!(matches!(
        alice.manager.answer().await,
        Err(CallError::SignalRejected(_))
    ));
    assert!(matches!(alice.ended().await, EndReason::SignalRejected(_)));
    assert_eq!(alice.manager.state(), CallState::Idle);
    assert_eq!(network.live_links(), 0);
    assert!(matches!(bob.recv().await, RelayMessage::CallEnd(_)));

    alice.finish().await;
}

#[tokio::test]
async fn accept_from_wrong_peer_is_ignored() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;
    let carol = Remote::join(&relay, "c3").await;

    alice.manager.place_call("b2").await.unwrap();
    let invite = bob.expect_invite().await;
    let (bob_link, answer, _bob_events) = loopback_answer(&network, invite.signal).await;

    // Carol forges an accept carrying a valid answer
    carol.accept("a1", answer.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.manager.state(), CallState::Negotiating);
    assert!(alice.manager.snapshot().remote_stream.is_none());

    bob.accept("a1", answer).await;
    let snapshot = alice.wait_state(CallState::Connected).await;
    assert_eq!(snapshot.peer, Some(PeerId::new("b2")));
    assert_eq!(snapshot.remote_display_name.as_deref(), Some("Bob"));
    assert!(snapshot.remote_stream.is_some());

    bob_link.destroy().await;
    alice.finish().await;
}

#[tokio::test]
async fn accept_without_sender_connects_to_invited_peer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let invite = bob.expect_invite().await;
    let (bob_link, answer, _bob_events) = loopback_answer(&network, invite.signal).await;

    let wire = serde_json::to_string(&json!({
        "event": "call-accept",
        "data": {"to": "a1", "signal": answer},
    }))
    .unwrap();
    let accept = RelayMessage::decode(&wire).unwrap();
    assert!(matches!(
        accept,
        RelayMessage::CallAccept(CallAccept { from: None, name: None, .. })
    ));
    bob.send(accept).await;

    let snapshot = alice.wait_state(CallState::Connected).await;
    assert_eq!(snapshot.peer, Some(PeerId::new("b2")));
    assert_eq!(snapshot.remote_display_name, None);
    assert!(snapshot.remote_stream.is_some());
    assert_eq!(snapshot.role, Some(CallRole::Caller));

    bob_link.destroy().await;
    alice.finish().await;
}

#[tokio::test]
async fn bare_accept_after_cancel_is_ignored() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let invite = bob.expect_invite().await;
    let (bob_link, answer, _bob_events) = loopback_answer(&network, invite.signal).await;
    alice.manager.end_call().await.unwrap();
    alice.wait_state(CallState::Idle).await;

    bob.accept_bare("a1", answer).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.manager.state(), CallState::Idle);
    assert_eq!(network.live_links(), 1);

    bob_link.destroy().await;
    alice.finish().await;
}

#[tokio::test]
async fn malformed_accept_ends_call() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let _ = bob.expect_invite().await;
    bob.accept(
        "a1",
        Signal::new(json!({"type": "answer", "session": "someone-else"})),
    )
    .await;

    assert!(matches!(alice.ended().await, EndReason::SignalRejected(_)));
    alice.wait_state(CallState::Idle).await;
    assert_eq!(network.live_links(), 0);
    assert!(matches!(
        bob.recv().await,
        RelayMessage::CallEnd(CallHangup { ref to, .. }) if to == &PeerId::new("b2")
    ));

    alice.finish().await;
}

#[tokio::test]
async fn remote_decline_ends_outgoing_call() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let _ = bob.expect_invite().await;
    bob.send(RelayMessage::CallDecline(CallDecline {
        to: PeerId::new("a1"),
        from: PeerId::new("b2"),
        reason: Some("busy".to_string()),
    }))
    .await;

    assert_eq!(
        alice.ended().await,
        EndReason::RemoteDeclined(Some("busy".to_string()))
    );
    alice.wait_state(CallState::Idle).await;
    assert_eq!(network.live_links(), 0);
    bob.expect_silence().await;

    alice.finish().await;
}

async fn connected_call(
    relay: &MemoryRelay,
    network: &LoopbackNetwork,
) -> (Client, Remote, PeerLinkAdapter) {
    let alice = Client::alice(relay, network).await;
    let bob = Remote::join(relay, "b2").await;
    alice.manager.place_call("b2").await.unwrap();
    let invite = bob.expect_invite().await;
    let (bob_link, answer, _) = loopback_answer(network, invite.signal).await;
    bob.accept("a1", answer).await;
    alice.wait_state(CallState::Connected).await;
    (alice, bob, bob_link)
}

#[tokio::test]
async fn link_failure_ends_connected_call() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (mut alice, bob, bob_link) = connected_call(&relay, &network).await;

    network.break_all("ice disconnected");
    assert!(matches!(
        alice.ended().await,
        EndReason::LinkFailure(ref r) if r == "ice disconnected"
    ));
    alice.wait_state(CallState::Idle).await;
    assert!(matches!(bob.recv().await, RelayMessage::CallEnd(_)));

    bob_link.destroy().await;
    alice.finish().await;
}

#[tokio::test]
async fn remote_hangup_ends_call_without_echo() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (mut alice, bob, bob_link) = connected_call(&relay, &network).await;

    bob.hang_up("a1").await;
    let event = alice
        .next_event(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        event,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            duration: Some(_),
            ..
        }
    ));
    alice.wait_state(CallState::Idle).await;
    bob.expect_silence().await;

    bob_link.destroy().await;
    alice.finish().await;
}

#[tokio::test]
async fn hangup_from_unrelated_peer_is_ignored() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, _bob, bob_link) = connected_call(&relay, &network).await;
    let carol = Remote::join(&relay, "c3").await;

    carol.hang_up("a1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.manager.state(), CallState::Connected);

    bob_link.destroy().await;
    alice.finish().await;
}

/// Records the published call state at the moment each link is destroyed
struct ObservedFactory {
    inner: LoopbackNetwork,
    snapshots: Arc<OnceLock<watch::Receiver<CallSnapshot>>>,
    seen_at_destroy: Arc<Mutex<Vec<CallState>>>,
}

struct ObservedLink {
    inner: Box<dyn PeerLink>,
    snapshots: Arc<OnceLock<watch::Receiver<CallSnapshot>>>,
    seen_at_destroy: Arc<Mutex<Vec<CallState>>>,
}

#[async_trait]
impl PeerLinkFactory for ObservedFactory {
    async fn create(
        &self,
        role: CallRole,
        tracks: MediaTrackSet,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, LinkError> {
        let inner = self.inner.create(role, tracks, events).await?;
        Ok(Box::new(ObservedLink {
            inner,
            snapshots: self.snapshots.clone(),
            seen_at_destroy: self.seen_at_destroy.clone(),
        }))
    }
}

#[async_trait]
impl PeerLink for ObservedLink {
    async fn accept_remote_signal(&self, signal: Signal) -> Result<(), LinkError> {
        self.inner.accept_remote_signal(signal).await
    }

    async fn destroy(&self) {
        if let Some(rx) = self.snapshots.get() {
            let state = rx.borrow().state;
            self.seen_at_destroy.lock().push(state);
        }
        self.inner.destroy().await;
    }
}

#[tokio::test]
async fn end_call_destroys_link_before_ended_is_published() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let snapshots = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = ObservedFactory {
        inner: network.clone(),
        snapshots: snapshots.clone(),
        seen_at_destroy: seen.clone(),
    };
    let mut alice =
        Client::start(&relay, "a1", Arc::new(factory), named("Alice"), true).await;
    snapshots.set(alice.manager.watch()).unwrap();
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let invite = bob.expect_invite().await;
    let (bob_link, answer, _) = loopback_answer(&network, invite.signal).await;
    bob.accept("a1", answer).await;
    alice.wait_state(CallState::Connected).await;

    alice.manager.end_call().await.unwrap();
    assert_eq!(*seen.lock(), vec![CallState::Connected]);
    assert_eq!(alice.manager.state(), CallState::Idle);
    assert_eq!(alice.ended().await, EndReason::LocalHangup);
    assert_eq!(network.live_links(), 1);
    assert!(matches!(
        bob.recv().await,
        RelayMessage::CallEnd(CallHangup { reason: Some(ref r), .. }) if r == "hangup"
    ));

    bob_link.destroy().await;
    assert_eq!(network.live_links(), 0);
    alice.finish().await;
}

#[tokio::test]
async fn cancel_before_answer_notifies_callee() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.place_call("b2").await.unwrap();
    let _ = bob.expect_invite().await;
    alice.manager.end_call().await.unwrap();

    assert_eq!(alice.ended().await, EndReason::LocalHangup);
    assert_eq!(network.live_links(), 0);
    assert!(matches!(bob.recv().await, RelayMessage::CallEnd(_)));

    alice.finish().await;
}

#[tokio::test]
async fn shutdown_ends_active_call() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob, bob_link) = connected_call(&relay, &network).await;

    alice.manager.shutdown().await;
    assert!(matches!(
        bob.recv().await,
        RelayMessage::CallEnd(CallHangup { reason: Some(ref r), .. }) if r == "shutdown"
    ));
    assert_eq!(alice.manager.end_call().await, Err(CallError::Shutdown));

    bob_link.destroy().await;
    assert_eq!(network.live_links(), 0);
}

#[tokio::test]
async fn display_name_change_applies_to_next_invite() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = Client::alice(&relay, &network).await;
    let bob = Remote::join(&relay, "b2").await;

    alice.manager.set_display_name(Some("Alice Cooper".to_string()));
    alice.manager.place_call("b2").await.unwrap();
    assert_eq!(bob.expect_invite().await.name, "Alice Cooper");

    alice.finish().await;
}

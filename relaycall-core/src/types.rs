//! Call types and data structures

use crate::call::CallError;
use crate::identity::PeerId;
use crate::peer_link::RemoteStream;
use crate::signaling::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one call attempt
///
/// Used to correlate logs and events; it never travels over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which devices to request from the local media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a microphone
    pub audio: bool,
    /// Request a camera
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Whether nothing is requested
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// Requested kinds, audio first
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Side of the call this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Sent the invite
    Caller,
    /// Received the invite
    Callee,
}

/// Call lifecycle state
///
/// ```text
///   Idle ──invite in──▶ Ringing ──answer──┐
///    │                    │               ▼
///    └──place call──▶ Negotiating ──stream──▶ Connected
///                         │                     │
///                         └───────▶ Ended ◀─────┘
///                                    │
///                                    ▼
///                                  Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Incoming invite waiting for the user
    Ringing,
    /// Signals being exchanged
    Negotiating,
    /// Remote media is flowing
    Connected,
    /// Call finished; immediately followed by Idle
    Ended,
}

impl CallState {
    /// Whether a peer link is expected to exist in this state
    pub fn has_link(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

/// Why a call left the active states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// This user hung up or cancelled
    LocalHangup,
    /// The peer hung up or cancelled
    RemoteHangup,
    /// This user declined the incoming call
    Declined,
    /// The peer declined (or was busy)
    RemoteDeclined(Option<String>),
    /// Nobody answered before the ring timeout
    Timeout,
    /// The peer link failed
    LinkFailure(String),
    /// A signaling payload was malformed or did not match the session
    SignalRejected(String),
    /// The call engine stopped
    Shutdown,
}

/// The aggregate call record
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Correlation id for this attempt
    pub call_id: CallId,
    /// Remote party; `None` only while Idle
    pub peer: Option<PeerId>,
    /// Label sent with our invites and accepts
    pub local_display_name: Option<String>,
    /// Label received from the peer
    pub remote_display_name: Option<String>,
    /// Fixed once an attempt begins
    pub role: Option<CallRole>,
    /// Current state
    pub state: CallState,
    /// Remote offer held while Ringing
    pub pending_remote_signal: Option<Signal>,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// When the remote stream arrived
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create an idle session
    pub fn idle(local_display_name: Option<String>) -> Self {
        Self {
            call_id: CallId::new(),
            peer: None,
            local_display_name,
            remote_display_name: None,
            role: None,
            state: CallState::Idle,
            pending_remote_signal: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Start an outgoing attempt
    pub fn outgoing(local_display_name: Option<String>, peer: PeerId) -> Self {
        Self {
            peer: Some(peer),
            role: Some(CallRole::Caller),
            state: CallState::Negotiating,
            ..Self::idle(local_display_name)
        }
    }

    /// Record an incoming invite
    pub fn incoming(
        local_display_name: Option<String>,
        peer: PeerId,
        remote_display_name: Option<String>,
        signal: Signal,
    ) -> Self {
        Self {
            peer: Some(peer),
            remote_display_name,
            role: Some(CallRole::Callee),
            state: CallState::Ringing,
            pending_remote_signal: Some(signal),
            ..Self::idle(local_display_name)
        }
    }

    /// Whether `id` is the remote party of this session
    pub fn is_peer(&self, id: &PeerId) -> bool {
        self.peer.as_ref() == Some(id)
    }

    /// Time spent connected
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

/// Observable copy of the call state
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Correlation id
    pub call_id: CallId,
    /// Current state
    pub state: CallState,
    /// Role, if a call attempt is in progress
    pub role: Option<CallRole>,
    /// Remote party
    pub peer: Option<PeerId>,
    /// Our label
    pub local_display_name: Option<String>,
    /// Peer's label
    pub remote_display_name: Option<String>,
    /// Whether a remote offer is waiting for an answer
    pub has_pending_signal: bool,
    /// Whether a live peer link exists
    pub has_link: bool,
    /// Remote media, once connected
    pub remote_stream: Option<RemoteStream>,
}

impl CallSnapshot {
    /// Build a snapshot from the session record
    pub fn from_session(
        session: &CallSession,
        has_link: bool,
        remote_stream: Option<RemoteStream>,
    ) -> Self {
        Self {
            call_id: session.call_id,
            state: session.state,
            role: session.role,
            peer: session.peer.clone(),
            local_display_name: session.local_display_name.clone(),
            remote_display_name: session.remote_display_name.clone(),
            has_pending_signal: session.pending_remote_signal.is_some(),
            has_link,
            remote_stream,
        }
    }

    /// Check the session invariants
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state != CallState::Idle && self.peer.as_ref().map_or(true, PeerId::is_empty) {
            return Err(format!("peer missing in state {:?}", self.state));
        }
        if self.state == CallState::Idle && self.peer.is_some() {
            return Err("peer set while idle".to_string());
        }
        if self.has_link != self.state.has_link() {
            return Err(format!(
                "link presence {} does not match state {:?}",
                self.has_link, self.state
            ));
        }
        if self.has_pending_signal && self.state != CallState::Ringing {
            return Err(format!("pending signal kept in state {:?}", self.state));
        }
        if self.remote_stream.is_some() && self.state != CallState::Connected {
            return Err(format!("remote stream exposed in state {:?}", self.state));
        }
        Ok(())
    }
}

/// Call event for observers
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Incoming invite; the session is Ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Caller identity
        from: PeerId,
        /// Caller display name
        name: Option<String>,
    },
    /// Outgoing call started
    CallPlaced {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        to: PeerId,
    },
    /// State transition
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
    },
    /// Remote media is available
    RemoteStream {
        /// Call identifier
        call_id: CallId,
        /// The stream
        stream: RemoteStream,
    },
    /// Call left the active states
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: EndReason,
        /// Connected duration, if it got that far
        duration: Option<chrono::Duration>,
    },
    /// A user action could not run; no state changed
    Unavailable {
        /// The recovered error
        error: CallError,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_media_constraints() {
        let audio = MediaConstraints::audio_only();
        assert_eq!(audio.kinds(), vec![MediaKind::Audio]);
        assert!(!audio.is_empty());

        let video = MediaConstraints::video_call();
        assert_eq!(video.kinds(), vec![MediaKind::Audio, MediaKind::Video]);

        let none = MediaConstraints {
            audio: false,
            video: false,
        };
        assert!(none.is_empty());
    }

    #[test]
    fn test_session_constructors() {
        let idle = CallSession::idle(Some("Alice".into()));
        assert_eq!(idle.state, CallState::Idle);
        assert!(idle.peer.is_none());
        assert!(idle.role.is_none());

        let out = CallSession::outgoing(None, PeerId::new("b2"));
        assert_eq!(out.state, CallState::Negotiating);
        assert_eq!(out.role, Some(CallRole::Caller));
        assert!(out.is_peer(&PeerId::new("b2")));

        let inc = CallSession::incoming(
            None,
            PeerId::new("a1"),
            Some("Alice".into()),
            Signal::new(json!({"type": "offer"})),
        );
        assert_eq!(inc.state, CallState::Ringing);
        assert_eq!(inc.role, Some(CallRole::Callee));
        assert!(inc.pending_remote_signal.is_some());
        assert!(inc.duration().is_none());
    }

    #[test]
    fn test_snapshot_invariants() {
        let idle = CallSession::idle(None);
        assert!(CallSnapshot::from_session(&idle, false, None)
            .check_invariants()
            .is_ok());
        assert!(CallSnapshot::from_session(&idle, true, None)
            .check_invariants()
            .is_err());

        let out = CallSession::outgoing(None, PeerId::new("b2"));
        assert!(CallSnapshot::from_session(&out, true, None)
            .check_invariants()
            .is_ok());
        assert!(CallSnapshot::from_session(&out, false, None)
            .check_invariants()
            .is_err());

        let mut broken = CallSession::outgoing(None, PeerId::new("b2"));
        broken.peer = None;
        assert!(CallSnapshot::from_session(&broken, true, None)
            .check_invariants()
            .is_err());
    }

    #[test]
    fn test_link_states() {
        assert!(!CallState::Idle.has_link());
        assert!(!CallState::Ringing.has_link());
        assert!(CallState::Negotiating.has_link());
        assert!(CallState::Connected.has_link());
        assert!(!CallState::Ended.has_link());
    }
}

//! Relaycall - one-to-one audio/video calling through a signaling relay
//!
//! Two clients connect to a relay, which assigns each a transient identity and
//! forwards addressed messages between them. One client invites another; the
//! relay carries the negotiation payloads and a direct peer link then carries
//! the media.
//!
//! - **Relay transport**: persistent connection, identity assignment,
//!   fire-and-forget sends and typed inbound events
//! - **Peer links**: pluggable engines behind one lifecycle contract, with a
//!   WebRTC engine and an in-process loopback engine
//! - **Call state machine**: Idle, Ringing, Negotiating, Connected and Ended,
//!   driven by a single task
//! - **Media control**: mute and camera toggles without renegotiation
//!
//! # Examples
//!
//! ```rust,no_run
//! use relaycall_core::{CallService, CallServiceConfig, MemoryRelay, LoopbackNetwork, PeerId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let links = Arc::new(LoopbackNetwork::new());
//!
//! let alice = CallService::builder(Arc::new(relay.connect()))
//!     .with_config(CallServiceConfig::default())
//!     .with_link_factory(links.clone())
//!     .build()
//!     .await?;
//! let bob = CallService::builder(Arc::new(relay.connect()))
//!     .with_link_factory(links)
//!     .build()
//!     .await?;
//!
//! alice.start().await?;
//! let bob_id: PeerId = bob.start().await?;
//!
//! alice.place_call(bob_id).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::panic))]

/// Call types and data structures
pub mod types;

/// Relay-assigned peer identity
pub mod identity;

/// Relay protocol and connection handling
pub mod signaling;

/// WebSocket and in-process relay connections
pub mod transport;

/// Local media tracks and toggles
pub mod media;

/// Peer link contract and loopback engine
pub mod peer_link;

/// WebRTC peer link engine
#[cfg(feature = "webrtc-link")]
pub mod webrtc_link;

/// Call session state machine
pub mod call;

/// Call service orchestration
pub mod service;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerConfig};
pub use identity::{IdentityError, LocalIdentity, PeerId};
pub use media::{
    LocalMediaSource, LocalTrack, MediaControl, MediaError, MediaFlags, MediaTrackSet,
    SyntheticMediaSource,
};
pub use peer_link::{
    LinkError, LinkEvent, LinkEventSink, LinkId, LoopbackNetwork, PeerLink, PeerLinkAdapter,
    PeerLinkFactory, RemoteStream,
};
pub use service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
pub use signaling::{
    CallAccept, CallDecline, CallHangup, CallInvite, RelayEventKind, RelayMessage, RelayStatus,
    RelayTransport, Signal, SignalingError, SignalingTransport, MAX_DISPLAY_NAME_LENGTH,
    MAX_SIGNALING_MESSAGE_SIZE,
};
pub use transport::{
    MemoryRelay, MemoryTransport, TransportConfig, TransportError, WebSocketTransport,
};
pub use types::*;
#[cfg(feature = "webrtc-link")]
pub use webrtc_link::{WebRtcLinkConfig, WebRtcLinkFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig};
    pub use crate::identity::PeerId;
    pub use crate::media::{LocalMediaSource, MediaControl, MediaFlags, SyntheticMediaSource};
    pub use crate::peer_link::{LoopbackNetwork, PeerLinkFactory};
    pub use crate::service::{CallService, CallServiceBuilder, CallServiceConfig};
    pub use crate::signaling::{RelayTransport, SignalingTransport};
    pub use crate::transport::{MemoryRelay, TransportConfig, WebSocketTransport};
    pub use crate::types::{
        CallEvent, CallId, CallSnapshot, CallState, EndReason, MediaConstraints, MediaKind,
    };
    #[cfg(feature = "webrtc-link")]
    pub use crate::webrtc_link::{WebRtcLinkConfig, WebRtcLinkFactory};
}

//! Call service orchestration

use crate::call::{CallError, CallManager, CallManagerConfig};
use crate::identity::PeerId;
use crate::media::{LocalMediaSource, MediaControl, MediaError, MediaFlags, SyntheticMediaSource};
use crate::peer_link::PeerLinkFactory;
use crate::signaling::{RelayStatus, RelayTransport, SignalingTransport};
use crate::transport::{TransportConfig, TransportError};
use crate::types::{CallEvent, CallId, CallSnapshot, CallState, MediaConstraints};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Relay connection error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Call service configuration
#[derive(Debug, Clone, Default)]
pub struct CallServiceConfig {
    /// Relay connection settings
    pub transport: TransportConfig,
    /// Devices requested when acquiring media
    pub default_constraints: MediaConstraints,
    /// Call engine settings
    pub call_config: CallManagerConfig,
}

/// One client: relay connection, local media and the call engine
pub struct CallService {
    relay: RelayTransport,
    media_source: Arc<dyn LocalMediaSource>,
    media: Arc<MediaControl>,
    calls: CallManager,
    constraints: MediaConstraints,
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<dyn SignalingTransport>) -> CallServiceBuilder {
        CallServiceBuilder::new(transport)
    }

    /// Connect to the relay, then acquire local media
    ///
    /// Failing to acquire media is not fatal: the service stays usable for
    /// receiving calls and [`acquire_media`](Self::acquire_media) can be
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns error if the relay connection fails
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<PeerId, ServiceError> {
        tracing::info!("Starting call service");
        let identity = self.relay.connect().await?;

        if let Err(e) = self.acquire_media().await {
            tracing::warn!(error = %e, "Continuing without local media");
        }

        tracing::info!(identity = %identity, "Call service started");
        Ok(identity)
    }

    /// Acquire local media with the configured constraints
    ///
    /// Only useful when an earlier acquisition failed: acquired tracks are
    /// kept for the life of the service.
    ///
    /// # Errors
    ///
    /// Returns error if media is already acquired or the media source refuses
    #[tracing::instrument(skip(self))]
    pub async fn acquire_media(&self) -> Result<(), ServiceError> {
        if self.media.has_media() {
            return Err(MediaError::AlreadyAcquired.into());
        }
        let tracks = self.media_source.acquire(&self.constraints).await?;
        self.media.attach(tracks)?;
        Ok(())
    }

    /// Call `target`
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    #[tracing::instrument(skip(self, target), fields(peer = %target))]
    pub async fn place_call(&self, target: PeerId) -> Result<CallId, ServiceError> {
        Ok(self.calls.place_call(target).await?)
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be answered
    pub async fn answer(&self) -> Result<(), ServiceError> {
        Ok(self.calls.answer().await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn decline(&self) -> Result<(), ServiceError> {
        Ok(self.calls.decline().await?)
    }

    /// Hang up or cancel
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        Ok(self.calls.end_call().await?)
    }

    /// Change the name sent to peers
    pub fn set_display_name(&self, name: Option<String>) {
        self.calls.set_display_name(name);
    }

    /// Mute or unmute; returns true if now muted
    pub fn toggle_audio(&self) -> bool {
        self.media.toggle_audio()
    }

    /// Camera off or on; returns true if now off
    pub fn toggle_video(&self) -> bool {
        self.media.toggle_video()
    }

    /// Current mute and camera flags
    pub fn media_flags(&self) -> MediaFlags {
        self.media.flags()
    }

    /// Observe mute and camera flags
    pub fn subscribe_media_flags(&self) -> watch::Receiver<MediaFlags> {
        self.media.subscribe()
    }

    /// Local media control
    pub fn media(&self) -> &Arc<MediaControl> {
        &self.media
    }

    /// Current call snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        self.calls.state()
    }

    /// Observe call snapshots
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.calls.watch()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe_events()
    }

    /// Identity assigned by the relay
    pub fn local_identity(&self) -> Option<PeerId> {
        self.relay.local_identity()
    }

    /// Relay connection status
    pub fn relay_status(&self) -> RelayStatus {
        self.relay.status()
    }

    /// Observe relay connection status
    pub fn subscribe_relay_status(&self) -> watch::Receiver<RelayStatus> {
        self.relay.subscribe_status()
    }

    /// The call engine handle
    pub fn call_manager(&self) -> &CallManager {
        &self.calls
    }

    /// End any call, stop the engine and close the relay connection
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.calls.shutdown().await;
        self.relay.disconnect().await;
        tracing::info!("Call service stopped");
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("relay", &self.relay)
            .field("calls", &self.calls)
            .field("media", &self.media.flags())
            .finish_non_exhaustive()
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    transport: Arc<dyn SignalingTransport>,
    config: CallServiceConfig,
    media_source: Option<Arc<dyn LocalMediaSource>>,
    link_factory: Option<Arc<dyn PeerLinkFactory>>,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            config: CallServiceConfig::default(),
            media_source: None,
            link_factory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the media source; defaults to [`SyntheticMediaSource`]
    #[must_use]
    pub fn with_media_source(mut self, source: Arc<dyn LocalMediaSource>) -> Self {
        self.media_source = Some(source);
        self
    }

    /// Set the peer link engine; defaults to WebRTC when that feature is on
    #[must_use]
    pub fn with_link_factory(mut self, factory: Arc<dyn PeerLinkFactory>) -> Self {
        self.link_factory = Some(factory);
        self
    }

    /// Build the service and start its call engine
    ///
    /// # Errors
    ///
    /// Returns error if no peer link engine is available
    pub async fn build(self) -> Result<CallService, ServiceError> {
        let links = match self.link_factory {
            Some(factory) => factory,
            None => default_link_factory()?,
        };
        let media_source = self
            .media_source
            .unwrap_or_else(|| Arc::new(SyntheticMediaSource::new()));

        let relay = RelayTransport::new(self.transport, self.config.transport);
        let media = Arc::new(MediaControl::new());
        let calls = CallManager::new(self.config.call_config, relay.clone(), links, media.clone());

        Ok(CallService {
            relay,
            media_source,
            media,
            calls,
            constraints: self.config.default_constraints,
        })
    }
}

#[cfg(feature = "webrtc-link")]
fn default_link_factory() -> Result<Arc<dyn PeerLinkFactory>, ServiceError> {
    use crate::webrtc_link::{WebRtcLinkConfig, WebRtcLinkFactory};
    let factory = WebRtcLinkFactory::new(WebRtcLinkConfig::default())
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-link"))]
fn default_link_factory() -> Result<Arc<dyn PeerLinkFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no peer link engine configured".to_string(),
    ))
}

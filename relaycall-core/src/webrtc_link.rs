//! WebRTC peer link engine
//!
//! Non-trickle negotiation: the offer or answer is reported only after ICE
//! gathering completes, so a single signal carries every candidate. The
//! signal is the session description as JSON, `{"type": "offer", "sdp": ..}`.
//!
//! Local tracks are attached as sample tracks; feeding encoded samples into
//! them is the media source's job. The remote stream is reported when the
//! peer connection reaches `Connected`.

use crate::media::{LocalTrack, MediaTrackSet};
use crate::peer_link::{LinkError, LinkEventSink, PeerLink, PeerLinkFactory, RemoteStream};
use crate::signaling::Signal;
use crate::types::{CallRole, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// WebRTC engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcLinkConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcLinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Peer link factory backed by the `webrtc` crate
pub struct WebRtcLinkFactory {
    api: API,
    config: WebRtcLinkConfig,
}

impl WebRtcLinkFactory {
    /// Build the WebRTC API with the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(config: WebRtcLinkConfig) -> Result<Self, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(failed)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for WebRtcLinkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLinkFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn failed(err: impl std::fmt::Display) -> LinkError {
    LinkError::Failed(err.to_string())
}

fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    #[tracing::instrument(skip(self, tracks, events), fields(link_id = events.link_id()))]
    async fn create(
        &self,
        role: CallRole,
        tracks: MediaTrackSet,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, LinkError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(failed)?,
        );

        for track in tracks.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_capability(track.kind()),
                track.id().to_string(),
                tracks.stream_id().to_string(),
            ));
            if let Err(e) = pc.add_track(local as Arc<dyn TrackLocal + Send + Sync>).await {
                let _ = pc.close().await;
                return Err(failed(e));
            }
        }

        watch_connection_state(&pc, events.clone());

        let link = WebRtcLink {
            pc: pc.clone(),
            role,
            events: events.clone(),
        };
        if role == CallRole::Caller {
            tokio::spawn(async move {
                let result = async {
                    let offer = pc.create_offer(None).await.map_err(failed)?;
                    publish_local_description(&pc, offer, &events).await
                }
                .await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to create offer");
                    events.failed(e.to_string());
                }
            });
        }
        Ok(Box::new(link))
    }
}

fn watch_connection_state(pc: &Arc<RTCPeerConnection>, events: LinkEventSink) {
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        let weak = weak.clone();
        Box::pin(async move {
            tracing::debug!(link_id = events.link_id(), ?state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => {
                    if let Some(pc) = weak.upgrade() {
                        events.remote_stream(remote_stream_of(&pc, events.link_id()).await);
                    }
                }
                RTCPeerConnectionState::Failed => events.failed("peer connection failed"),
                _ => {}
            }
        })
    }));
}

async fn remote_stream_of(pc: &RTCPeerConnection, link_id: u64) -> RemoteStream {
    let tracks = pc
        .get_transceivers()
        .await
        .iter()
        .enumerate()
        .filter_map(|(i, t)| {
            let kind = match t.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                _ => return None,
            };
            Some(LocalTrack::new(format!("remote-{kind}-{i}"), kind))
        })
        .collect();
    let id = format!("remote-{link_id}");
    RemoteStream::new(id.clone(), MediaTrackSet::new(id, tracks))
}

async fn publish_local_description(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
    events: &LinkEventSink,
) -> Result<(), LinkError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(failed)?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| LinkError::Failed("no local description".to_string()))?;
    let value = serde_json::to_value(&local).map_err(failed)?;
    tracing::debug!(
        link_id = events.link_id(),
        sdp_type = %local.sdp_type,
        "Local description gathered"
    );
    events.signal_ready(Signal::new(value));
    Ok(())
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    role: CallRole,
    events: LinkEventSink,
}

impl WebRtcLink {
    fn parse(signal: &Signal, expected: RTCSdpType) -> Result<RTCSessionDescription, LinkError> {
        let description: RTCSessionDescription =
            serde_json::from_value(signal.as_value().clone())
                .map_err(|e| LinkError::SignalRejected(format!("not a session description: {e}")))?;
        if description.sdp_type != expected {
            return Err(LinkError::SignalRejected(format!(
                "expected {expected}, got {}",
                description.sdp_type
            )));
        }
        Ok(description)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn accept_remote_signal(&self, signal: Signal) -> Result<(), LinkError> {
        match self.role {
            CallRole::Caller => {
                let answer = Self::parse(&signal, RTCSdpType::Answer)?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| LinkError::SignalRejected(e.to_string()))
            }
            CallRole::Callee => {
                let offer = Self::parse(&signal, RTCSdpType::Offer)?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| LinkError::SignalRejected(e.to_string()))?;

                let pc = self.pc.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = async {
                        let answer = pc.create_answer(None).await.map_err(failed)?;
                        publish_local_description(&pc, answer, &events).await
                    }
                    .await;
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Failed to create answer");
                        events.failed(e.to_string());
                    }
                });
                Ok(())
            }
        }
    }

    async fn destroy(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer_link::LinkEvent;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn offline_factory() -> WebRtcLinkFactory {
        WebRtcLinkFactory::new(WebRtcLinkConfig {
            ice_servers: Vec::new(),
        })
        .unwrap()
    }

    fn local_tracks() -> MediaTrackSet {
        MediaTrackSet::new(
            "local",
            vec![
                LocalTrack::new("audio-0", MediaKind::Audio),
                LocalTrack::new("video-0", MediaKind::Video),
            ],
        )
    }

    #[test]
    fn test_codec_capabilities() {
        let audio = codec_capability(MediaKind::Audio);
        assert_eq!(audio.mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.clock_rate, 48000);
        let video = codec_capability(MediaKind::Video);
        assert_eq!(video.mime_type, MIME_TYPE_VP8);
    }

    #[test]
    fn test_default_config_has_stun() {
        let config = WebRtcLinkConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].starts_with("stun:"));
    }

    #[tokio::test]
    async fn test_caller_emits_complete_offer() {
        let factory = offline_factory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = factory
            .create(CallRole::Caller, local_tracks(), LinkEventSink::new(1, tx))
            .await
            .unwrap();

        let (_, event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let LinkEvent::SignalReady(signal) = event else {
            panic!("expected offer");
        };
        assert_eq!(signal.as_value()["type"], "offer");
        let sdp = signal.as_value()["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        link.destroy().await;
    }

    #[tokio::test]
    async fn test_callee_rejects_wrong_signal() {
        let factory = offline_factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory
            .create(CallRole::Callee, local_tracks(), LinkEventSink::new(1, tx))
            .await
            .unwrap();

        let garbage = link
            .accept_remote_signal(Signal::new(json!({"hello": "world"})))
            .await;
        assert!(matches!(garbage, Err(LinkError::SignalRejected(_))));

        let answer_to_callee = link
            .accept_remote_signal(Signal::new(json!({"type": "answer", "sdp": "v=0"})))
            .await;
        assert!(matches!(answer_to_callee, Err(LinkError::SignalRejected(_))));
        link.destroy().await;
    }
}

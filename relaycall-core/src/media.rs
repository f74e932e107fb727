//! Local media tracks and media control
//!
//! Capturing and encoding media is the job of an external [`LocalMediaSource`].
//! This module only models what the call layer needs from it: a set of
//! tracks, each with an `enabled` flag that can be flipped at any time without
//! renegotiating the call.
//!
//! A [`MediaTrackSet`] is shared: the peer link reads it to attach tracks and
//! [`MediaControl`] mutates the flags. Flags are atomics, so neither side needs
//! to coordinate with the call state machine.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Permission denied or no matching device
    #[error("Media unavailable: {0}")]
    Unavailable(String),

    /// Nothing was requested
    #[error("No media kinds requested")]
    NothingRequested,

    /// Tracks are already attached and may be in use by a call
    #[error("Local media already acquired")]
    AlreadyAcquired,
}

/// One local (or mirrored remote) track
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether the track currently carries content
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable content
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Shared set of tracks from one media acquisition
#[derive(Debug, Clone, Default)]
pub struct MediaTrackSet {
    stream_id: String,
    tracks: Arc<Vec<Arc<LocalTrack>>>,
}

impl MediaTrackSet {
    /// Wrap acquired tracks
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Arc::new(tracks.into_iter().map(Arc::new).collect()),
        }
    }

    /// Identifier of the stream these tracks belong to
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Whether any track of `kind` exists
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Set the enabled flag on every track of `kind`
    pub fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// `Some(true)` if every track of `kind` is enabled, `None` if there are none
    pub fn kind_enabled(&self, kind: MediaKind) -> Option<bool> {
        let mut tracks = self.tracks_of(kind).peekable();
        tracks.peek()?;
        Some(tracks.all(|t| t.is_enabled()))
    }

    /// Whether two handles refer to the same acquisition
    pub fn same_set(&self, other: &MediaTrackSet) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

/// External capability that captures camera and microphone
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Acquire tracks matching `constraints`
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Unavailable`] if permission is denied or no
    /// matching device exists
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet, MediaError>;
}

/// Media source producing placeholder tracks
///
/// Stands in for real capture in tests and the demo; device presence and
/// permission can be configured to exercise the failure paths.
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    /// Whether a microphone exists
    pub has_microphone: bool,
    /// Whether a camera exists
    pub has_camera: bool,
    /// Whether the user refuses access
    pub permission_denied: bool,
}

impl SyntheticMediaSource {
    /// Source with both devices and permission granted
    pub fn new() -> Self {
        Self {
            has_microphone: true,
            has_camera: true,
            permission_denied: false,
        }
    }

    /// Source that refuses every request
    pub fn denied() -> Self {
        Self {
            permission_denied: true,
            ..Self::new()
        }
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalMediaSource for SyntheticMediaSource {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet, MediaError> {
        if constraints.is_empty() {
            return Err(MediaError::NothingRequested);
        }
        if self.permission_denied {
            return Err(MediaError::Unavailable("permission denied".to_string()));
        }
        if constraints.audio && !self.has_microphone {
            return Err(MediaError::Unavailable("no audio input device".to_string()));
        }
        if constraints.video && !self.has_camera {
            return Err(MediaError::Unavailable("no video input device".to_string()));
        }

        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let tracks = constraints
            .kinds()
            .into_iter()
            .map(|kind| LocalTrack::new(format!("{kind}-0"), kind))
            .collect();

        tracing::debug!(stream_id = %stream_id, "Synthetic media acquired");
        Ok(MediaTrackSet::new(stream_id, tracks))
    }
}

/// Mute and camera flags for the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    /// Audio tracks disabled
    pub audio_muted: bool,
    /// Video tracks disabled
    pub video_off: bool,
}

/// Toggles local track enablement
///
/// Independent of the call state: toggling before a call affects only the
/// local preview, and toggling before any media exists just records the flag
/// so it is applied when tracks are attached.
#[derive(Debug)]
pub struct MediaControl {
    tracks: Mutex<Option<MediaTrackSet>>,
    flags: watch::Sender<MediaFlags>,
}

impl MediaControl {
    /// Create a control with no tracks attached
    pub fn new() -> Self {
        let (flags, _) = watch::channel(MediaFlags::default());
        Self {
            tracks: Mutex::new(None),
            flags,
        }
    }

    /// Attach freshly acquired tracks, applying the current flags to them
    ///
    /// A non-empty set is never replaced: a peer link may be sending it, and
    /// the toggles must keep acting on the tracks the peer receives.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AlreadyAcquired`] if non-empty tracks are attached
    pub fn attach(&self, set: MediaTrackSet) -> Result<(), MediaError> {
        let mut tracks = self.tracks.lock();
        if tracks.as_ref().is_some_and(|current| !current.is_empty()) {
            return Err(MediaError::AlreadyAcquired);
        }
        let flags = *self.flags.borrow();
        set.set_kind_enabled(MediaKind::Audio, !flags.audio_muted);
        set.set_kind_enabled(MediaKind::Video, !flags.video_off);
        tracing::debug!(
            stream_id = set.stream_id(),
            tracks = set.tracks().len(),
            "Local media attached"
        );
        *tracks = Some(set);
        Ok(())
    }

    /// Current local tracks, if media has been acquired
    pub fn tracks(&self) -> Option<MediaTrackSet> {
        self.tracks.lock().clone()
    }

    /// Whether local media has been acquired
    pub fn has_media(&self) -> bool {
        self.tracks.lock().as_ref().is_some_and(|set| !set.is_empty())
    }

    /// Flip audio enablement; returns the new muted flag
    pub fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    /// Flip video enablement; returns the new camera-off flag
    pub fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video)
    }

    /// Whether audio is muted
    pub fn is_audio_muted(&self) -> bool {
        self.flags.borrow().audio_muted
    }

    /// Whether the camera is off
    pub fn is_video_off(&self) -> bool {
        self.flags.borrow().video_off
    }

    /// Current flags
    pub fn flags(&self) -> MediaFlags {
        *self.flags.borrow()
    }

    /// Observe flag changes
    pub fn subscribe(&self) -> watch::Receiver<MediaFlags> {
        self.flags.subscribe()
    }

    fn toggle(&self, kind: MediaKind) -> bool {
        // The track lock serializes concurrent toggles so the flag and the
        // tracks cannot drift apart.
        let tracks = self.tracks.lock();
        let mut flags = *self.flags.borrow();
        let disabled = match kind {
            MediaKind::Audio => {
                flags.audio_muted = !flags.audio_muted;
                flags.audio_muted
            }
            MediaKind::Video => {
                flags.video_off = !flags.video_off;
                flags.video_off
            }
        };
        if let Some(set) = tracks.as_ref() {
            set.set_kind_enabled(kind, !disabled);
        }
        self.flags.send_replace(flags);
        tracing::debug!(kind = %kind, disabled, "Toggled local media");
        disabled
    }
}

impl Default for MediaControl {
    fn default() -> Self {
        Self::new()
    }
}

//! Local media capture
//!
//! [`MediaController`] is the single owner of the local capture stream. Peer
//! connections only ever hold `Arc<LocalTrack>` read references, so enabling
//! or disabling a track here is seen by every connection at once and needs
//! no renegotiation.
//!
//! Device access itself sits behind [`MediaDevices`]; the engine only cares
//! about the constraints it asks for and the tracks it gets back.

use crate::identity::UserId;
use crate::peer::PeerConnectionManager;
use crate::types::{MediaKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied for {0}")]
    PermissionDenied(MediaKind),

    /// Device in use by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No device satisfies the constraints
    #[error("Constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),

    /// Operation needs an acquired stream
    #[error("No local stream")]
    NoStream,

    /// The stream has no track of this kind
    #[error("No local {0} track")]
    NoTrack(MediaKind),

    /// Track was added but no connection accepted it
    #[error("Renegotiation failed: {0}")]
    RenegotiationFailed(String),
}

/// Lifecycle of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackReadyState {
    /// Capturing
    Live,
    /// Stopped for good
    Ended,
}

/// A captured local track
///
/// `enabled` mutes the track without removing it from any connection.
/// `stop` ends it permanently.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", kind, Uuid::new_v4()),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether media is sent
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Live or ended
    pub fn ready_state(&self) -> TrackReadyState {
        if self.ended.load(Ordering::SeqCst) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    /// Stop capturing; irreversible
    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// The local capture stream shared by every connection
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: RwLock<Vec<Arc<LocalTrack>>>,
}

impl LocalStream {
    /// Wrap acquired tracks
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: RwLock::new(tracks),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.read().clone()
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> Vec<Arc<LocalTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Whether a live track of `kind` exists
    pub fn has_live(&self, kind: MediaKind) -> bool {
        self.tracks
            .read()
            .iter()
            .any(|t| t.kind() == kind && t.ready_state() == TrackReadyState::Live)
    }

    fn add_track(&self, track: Arc<LocalTrack>) {
        self.tracks.write().push(track);
    }

    fn remove_track(&self, id: &str) -> Option<Arc<LocalTrack>> {
        let mut tracks = self.tracks.write();
        let index = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(index))
    }
}

/// Audio processing constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ideal camera settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Ideal width in pixels
    pub ideal_width: u32,
    /// Ideal height in pixels
    pub ideal_height: u32,
    /// Ideal frames per second
    pub ideal_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            ideal_frame_rate: 30,
        }
    }
}

/// What to capture; `None` means the kind is not requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Microphone constraints
    pub audio: Option<AudioConstraints>,
    /// Camera constraints
    pub video: Option<VideoConstraints>,
}

impl CaptureConstraints {
    /// Audio always, video when asked
    pub fn for_call(wants_video: bool) -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: wants_video.then(VideoConstraints::default),
        }
    }

    /// Microphone only
    pub fn audio_only() -> Self {
        Self::for_call(false)
    }

    /// A single kind, for adding a track mid-call
    pub fn only(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::audio_only(),
            MediaKind::Video => Self {
                audio: None,
                video: Some(VideoConstraints::default()),
            },
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested devices and return one track per requested kind
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError>;
}

/// Result of [`MediaController::acquire`]
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    /// The shared local stream
    pub stream: Arc<LocalStream>,
    /// Video was requested but only audio could be opened
    pub camera_unavailable: bool,
}

/// Owner of the local capture stream
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    stream: RwLock<Option<Arc<LocalStream>>>,
    camera_unavailable: AtomicBool,
    acquire_lock: tokio::sync::Mutex<()>,
}

impl MediaController {
    /// Create a controller over a device backend
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: RwLock::new(None),
            camera_unavailable: AtomicBool::new(false),
            acquire_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquire the local stream
    ///
    /// The stream is created at most once; while one exists it is returned
    /// as-is. A failed video request falls back to audio only and sets the
    /// camera-unavailable flag.
    ///
    /// # Errors
    ///
    /// Returns error when audio cannot be captured either.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, wants_video: bool) -> Result<AcquiredMedia, MediaError> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(stream) = self.stream() {
            tracing::debug!("Reusing local stream");
            return Ok(AcquiredMedia {
                stream,
                camera_unavailable: self.camera_unavailable(),
            });
        }

        let (tracks, camera_unavailable) = match self
            .devices
            .get_user_media(&CaptureConstraints::for_call(wants_video))
            .await
        {
            Ok(tracks) => (tracks, false),
            Err(e) if wants_video => {
                tracing::warn!(error = %e, "Camera unavailable, retrying audio only");
                let tracks = self
                    .devices
                    .get_user_media(&CaptureConstraints::audio_only())
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Audio capture failed");
                        e
                    })?;
                (tracks, true)
            }
            Err(e) => {
                tracing::error!(error = %e, "Audio capture failed");
                return Err(e);
            }
        };

        let stream = Arc::new(LocalStream::new(tracks));
        self.camera_unavailable
            .store(camera_unavailable, Ordering::SeqCst);
        *self.stream.write() = Some(stream.clone());

        tracing::info!(
            stream_id = stream.id(),
            tracks = stream.tracks().len(),
            camera_unavailable,
            "Local stream acquired"
        );
        Ok(AcquiredMedia {
            stream,
            camera_unavailable,
        })
    }

    /// Current stream
    #[must_use]
    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.read().clone()
    }

    /// Whether the last acquisition fell back to audio only
    #[must_use]
    pub fn camera_unavailable(&self) -> bool {
        self.camera_unavailable.load(Ordering::SeqCst)
    }

    /// Whether tracks of `kind` are enabled (`None` without such tracks)
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        let stream = self.stream()?;
        let tracks = stream.tracks_of(kind);
        tracks.first().map(|t| t.is_enabled())
    }

    /// Flip `enabled` on every track of `kind`
    ///
    /// Returns the new state, or `None` when there is no such track.
    pub fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let stream = self.stream()?;
        let tracks = stream.tracks_of(kind);
        let enabled = !tracks.first()?.is_enabled();
        for track in &tracks {
            track.set_enabled(enabled);
        }
        tracing::debug!(kind = %kind, enabled, "Toggled local media");
        Some(enabled)
    }

    /// Capture a new track of `kind` and renegotiate every connection
    ///
    /// The track joins the shared stream and every existing connection. Each
    /// connection whose renegotiation fails has the track removed again; if
    /// no connection accepts it, it is removed from the stream and stopped.
    /// Returns the offers to send, keyed by participant.
    ///
    /// # Errors
    ///
    /// Returns error without a stream, on capture failure, or when every
    /// connection rejected the track.
    #[tracing::instrument(skip(self, peers))]
    pub async fn add_track_late(
        &self,
        kind: MediaKind,
        peers: &PeerConnectionManager,
    ) -> Result<Vec<(UserId, SessionDescription)>, MediaError> {
        let stream = self.stream().ok_or(MediaError::NoStream)?;
        if stream.has_live(kind) {
            tracing::debug!("Track already present, nothing to add");
            return Ok(Vec::new());
        }

        let track = self
            .devices
            .get_user_media(&CaptureConstraints::only(kind))
            .await?
            .into_iter()
            .find(|t| t.kind() == kind)
            .ok_or_else(|| MediaError::DeviceNotFound(kind.to_string()))?;

        stream.add_track(track.clone());
        let results = peers.add_track_and_renegotiate(track.clone()).await;
        let attempted = results.len();

        let mut offers = Vec::new();
        let mut last_error = None;
        for (participant, result) in results {
            match result {
                Ok(offer) => offers.push((participant, offer)),
                Err(e) => {
                    tracing::warn!(participant = %participant, error = %e, "Renegotiation failed, track rolled back");
                    last_error = Some(e);
                }
            }
        }

        if attempted > 0 && offers.is_empty() {
            stream.remove_track(track.id());
            peers.remove_local_track(track.id());
            track.stop();
            return Err(MediaError::RenegotiationFailed(
                last_error.map_or_else(String::new, |e| e.to_string()),
            ));
        }

        if kind == MediaKind::Video {
            self.camera_unavailable.store(false, Ordering::SeqCst);
        }
        tracing::info!(track_id = track.id(), renegotiated = offers.len(), "Track added mid-call");
        Ok(offers)
    }

    /// Stop every track and drop the stream
    ///
    /// Returns the number of tracks stopped.
    pub fn release(&self) -> usize {
        let Some(stream) = self.stream.write().take() else {
            return 0;
        };
        let tracks = stream.tracks();
        for track in &tracks {
            track.stop();
        }
        self.camera_unavailable.store(false, Ordering::SeqCst);
        tracing::info!(stream_id = stream.id(), tracks = tracks.len(), "Local stream released");
        tracks.len()
    }
}

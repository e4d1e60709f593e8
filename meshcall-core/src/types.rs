//! Call types and data structures

use crate::identity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
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

/// Identifier of the group (chat room) a call belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    /// Create a new group id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call requested by the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Voice only
    Audio,
    /// Voice and camera
    Video,
}

impl CallType {
    /// Whether a camera track should be requested
    pub fn wants_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Wire name of the call type
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl MediaKind {
    /// Wire name of the media kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened the session being connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Started by the local user
    Outgoing,
    /// Announced by another participant
    Incoming,
}

/// Call state enumeration
///
/// ```text
///   Idle ──► Connecting(Outgoing|Incoming) ──► Active
///                 │                              │
///                 └──────────► Ended ◄───────────┘
/// ```
///
/// `Ended` is terminal for a call instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Start or join in progress
    Connecting(CallDirection),
    /// Media is flowing (or being negotiated) with participants
    Active,
    /// Call is over
    Ended,
}

impl CallState {
    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Check if a state transition is valid
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (CallState::Idle, CallState::Connecting(_))
                | (CallState::Idle, CallState::Active)
                // Accepting an incoming call keeps it connecting until the handshake ends
                | (CallState::Connecting(_), CallState::Connecting(_))
                | (CallState::Connecting(_), CallState::Active)
                | (CallState::Connecting(_), CallState::Ended)
                | (CallState::Active, CallState::Ended)
        )
    }
}

/// Native peer connection state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Created, nothing exchanged yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

impl PeerConnectionState {
    /// Map the native state onto the quality signal shown to users
    pub fn quality(self) -> ConnectionQuality {
        match self {
            Self::Connected => ConnectionQuality::Good,
            Self::New | Self::Connecting => ConnectionQuality::Degraded,
            Self::Disconnected | Self::Failed | Self::Closed => ConnectionQuality::Broken,
        }
    }
}

/// Per-participant link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Connected
    Good,
    /// Still connecting
    Degraded,
    /// Disconnected or failed
    Broken,
}

/// A participant of a group call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// User identifier
    pub user_id: UserId,
    /// Display name
    pub display_name: String,
    /// Avatar location
    pub avatar_url: Option<String>,
    /// Microphone enabled
    pub is_audio_enabled: bool,
    /// Camera enabled
    pub is_video_enabled: bool,
    /// Quality of the link to this participant
    pub connection_quality: ConnectionQuality,
    /// When the participant joined
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Create a participant that just joined
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
            is_audio_enabled: true,
            is_video_enabled: false,
            connection_quality: ConnectionQuality::Degraded,
            joined_at: Utc::now(),
        }
    }

    /// Set the announced media flags
    pub fn with_media(mut self, audio: bool, video: bool) -> Self {
        self.is_audio_enabled = audio;
        self.is_video_enabled = video;
        self
    }
}

/// The call aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Call identifier
    pub id: CallId,
    /// Group the call belongs to
    pub group_id: GroupId,
    /// Audio or video
    pub call_type: CallType,
    /// Who started the call
    pub initiator_id: UserId,
    /// Everyone in the call, including the local user once joined
    pub participants: HashMap<UserId, Participant>,
    /// Current state
    pub state: CallState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Call {
    /// Create a new call instance
    pub fn new(
        id: CallId,
        group_id: GroupId,
        call_type: CallType,
        initiator_id: UserId,
        state: CallState,
    ) -> Self {
        Self {
            id,
            group_id,
            call_type,
            initiator_id,
            participants: HashMap::new(),
            state,
            created_at: Utc::now(),
        }
    }

    /// Move to a new state
    ///
    /// Returns `false` and leaves the state untouched if the transition is
    /// not allowed, which always holds once the call has ended.
    pub fn transition(&mut self, to: CallState) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        let old_state = self.state;
        self.state = to;
        tracing::debug!(
            call_id = %self.id,
            old_state = ?old_state,
            new_state = ?to,
            "Call state transition"
        );
        true
    }

    /// Add or replace a participant
    pub fn add_participant(&mut self, participant: Participant) {
        self.participants
            .insert(participant.user_id.clone(), participant);
    }

    /// Remove a participant
    pub fn remove_participant(&mut self, user_id: &UserId) -> Option<Participant> {
        self.participants.remove(user_id)
    }

    /// Participants other than `local`
    pub fn remote_participants<'a>(
        &'a self,
        local: &'a UserId,
    ) -> impl Iterator<Item = &'a Participant> + 'a {
        self.participants
            .values()
            .filter(move |p| &p.user_id != local)
    }

    /// Whether `user` started this call
    pub fn is_initiator(&self, user: &UserId) -> bool {
        &self.initiator_id == user
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// SDP session description exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for WebRTC connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: String,
    /// TURN credential
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    /// Credential-less STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Public STUN servers used when none are configured
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

/// A track received from a remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track identifier as announced by the remote peer
    pub track_id: String,
    /// Audio or video
    pub kind: MediaKind,
}

/// All tracks received from one remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Owner of the stream
    pub participant: UserId,
    /// Tracks in arrival order
    pub tracks: Vec<RemoteTrackInfo>,
}

/// Immutable view of the session published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session state
    pub state: CallState,
    /// The current (or last) call, if any
    pub call: Option<Call>,
    /// Video was requested but the camera could not be opened
    pub camera_unavailable: bool,
    /// Membership could not be re-registered after a signaling reconnect
    pub degraded: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            call: None,
            camera_unavailable: false,
            degraded: false,
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Session state changed
    StateChanged {
        /// Snapshot after the change
        snapshot: SessionSnapshot,
    },
    /// Another user started a call we can join
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Group of the call
        group_id: GroupId,
        /// Who started it
        initiator_id: UserId,
        /// Audio or video
        call_type: CallType,
    },
    /// A participant joined
    ParticipantJoined {
        /// Call identifier
        call_id: CallId,
        /// The participant
        participant: Participant,
    },
    /// A participant left or was evicted
    ParticipantLeft {
        /// Call identifier
        call_id: CallId,
        /// Who left
        user_id: UserId,
        /// Removed because the link never recovered
        evicted: bool,
    },
    /// A participant toggled a media kind
    MediaToggled {
        /// Call identifier
        call_id: CallId,
        /// Who toggled
        user_id: UserId,
        /// Which kind
        kind: MediaKind,
        /// New state
        enabled: bool,
    },
    /// Link quality to a participant changed
    QualityChanged {
        /// Participant
        user_id: UserId,
        /// New quality
        quality: ConnectionQuality,
    },
    /// First track (or a new track) received from a participant
    RemoteStreamAdded {
        /// Stream owner
        participant: UserId,
        /// The new track
        track: RemoteTrackInfo,
    },
    /// A participant's stream went away
    RemoteStreamRemoved {
        /// Stream owner
        participant: UserId,
    },
    /// Rejoin after reconnect was abandoned
    Degraded {
        /// Call identifier
        call_id: CallId,
    },
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call() -> Call {
        Call::new(
            CallId::new(),
            GroupId::new("g"),
            CallType::Video,
            UserId::new("alice"),
            CallState::Connecting(CallDirection::Outgoing),
        )
    }

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut call = call();
        assert!(call.transition(CallState::Active));
        assert!(call.transition(CallState::Ended));
        assert!(!call.transition(CallState::Active));
        assert!(!call.transition(CallState::Connecting(CallDirection::Incoming)));
        assert!(!call.transition(CallState::Idle));
        assert_eq!(call.state, CallState::Ended);
    }

    #[test]
    fn test_active_cannot_go_back_to_connecting() {
        let mut call = call();
        assert!(call.transition(CallState::Active));
        assert!(!call.transition(CallState::Connecting(CallDirection::Outgoing)));
        assert_eq!(call.state, CallState::Active);
    }

    #[test]
    fn test_connection_quality_mapping() {
        assert_eq!(
            PeerConnectionState::Connected.quality(),
            ConnectionQuality::Good
        );
        assert_eq!(
            PeerConnectionState::Connecting.quality(),
            ConnectionQuality::Degraded
        );
        assert_eq!(
            PeerConnectionState::Disconnected.quality(),
            ConnectionQuality::Broken
        );
        assert_eq!(
            PeerConnectionState::Failed.quality(),
            ConnectionQuality::Broken
        );
    }

    #[test]
    fn test_remote_participants_excludes_local() {
        let mut call = call();
        call.add_participant(Participant::new(UserId::new("alice"), "Alice"));
        call.add_participant(Participant::new(UserId::new("bob"), "Bob"));
        let local = UserId::new("alice");
        let remote: Vec<_> = call
            .remote_participants(&local)
            .map(|p| p.user_id.clone())
            .collect();
        assert_eq!(remote, vec![UserId::new("bob")]);
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}

//! Group call signaling protocol
//!
//! The engine never talks to a concrete real-time transport. It needs three
//! capabilities from one, captured by [`SignalingGateway`]: invoke a named
//! server method, receive named events, and report whether the channel is
//! currently connected.
//!
//! Everything that crosses the gateway is typed here. Inbound events are
//! decoded once into [`SignalingMessage`] so handlers can match exhaustively;
//! outbound invocations go through [`SignalingClient`], which adds the
//! bounded wait, fail-fast on a disconnected channel, and fallback method
//! names.

use crate::identity::UserId;
use crate::retry::RetryPolicy;
use crate::types::{
    CallId, CallType, GroupId, IceCandidate, MediaKind, Participant, SessionDescription,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Channel is not connected, nothing was sent
    #[error("Signaling channel disconnected")]
    Disconnected,

    /// No response within the bounded wait
    #[error("Invoke of {0} timed out")]
    Timeout(String),

    /// Server does not know the method
    #[error("Method not supported: {0}")]
    MethodUnsupported(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Inbound payload did not match the event's schema
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event name
        event: String,
        /// Decoder message
        reason: String,
    },

    /// Event name is not part of the protocol
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

/// Connection state of the real-time channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayState {
    /// Usable
    Connected,
    /// (Re)connecting
    Connecting,
    /// Down
    Disconnected,
}

/// Something the gateway tells its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A server event with its raw payload
    Message {
        /// Event name, e.g. `GroupCallStarted`
        name: String,
        /// Event payload
        payload: Value,
    },
    /// Channel dropped
    Disconnected,
    /// Channel came back after a drop
    Reconnected,
}

/// Minimal real-time channel the engine depends on
///
/// Implement this for your transport (WebSocket hub, SignalR, ...). Invokes
/// issued while disconnected must fail promptly instead of queueing.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Invoke a server method
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), SignalingError>;

    /// Subscribe to server events and connection changes
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    /// Current connection state
    fn connection_state(&self) -> GatewayState;
}

/// Server methods invoked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayMethod {
    /// Announce a new call to the group
    StartGroupCall,
    /// Register membership
    JoinGroupCall,
    /// Remove own membership
    LeaveGroupCall,
    /// Terminate for everyone
    EndGroupCall,
    /// Announce a mute/unmute
    ToggleGroupCallMedia,
    /// Relay an SDP offer
    SendGroupCallOffer,
    /// Relay an SDP answer
    SendGroupCallAnswer,
    /// Relay an ICE candidate
    SendGroupIceCandidate,
}

impl GatewayMethod {
    /// Primary method name
    pub fn name(self) -> &'static str {
        match self {
            Self::StartGroupCall => "StartGroupCall",
            Self::JoinGroupCall => "JoinGroupCall",
            Self::LeaveGroupCall => "LeaveGroupCall",
            Self::EndGroupCall => "EndGroupCall",
            Self::ToggleGroupCallMedia => "ToggleGroupCallMedia",
            Self::SendGroupCallOffer => "SendGroupCallOffer",
            Self::SendGroupCallAnswer => "SendGroupCallAnswer",
            Self::SendGroupIceCandidate => "SendGroupIceCandidate",
        }
    }

    /// Names tried after the primary one fails, for older hub versions
    pub fn fallback_names(self) -> &'static [&'static str] {
        match self {
            Self::StartGroupCall => &["InitiateGroupCall"],
            Self::JoinGroupCall => &["JoinCall", "JoinGroup"],
            Self::LeaveGroupCall => &["LeaveCall"],
            Self::EndGroupCall => &["EndCall"],
            _ => &[],
        }
    }

    /// Primary name followed by the fallbacks
    pub fn candidate_names(self) -> Vec<&'static str> {
        std::iter::once(self.name())
            .chain(self.fallback_names().iter().copied())
            .collect()
    }
}

/// Participant as announced over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// User identifier
    pub user_id: UserId,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Avatar location
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Microphone enabled
    #[serde(default = "default_true")]
    pub is_audio_enabled: bool,
    /// Camera enabled
    #[serde(default)]
    pub is_video_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ParticipantInfo {
    /// Convert into the call model
    pub fn into_participant(self) -> Participant {
        let mut participant = Participant::new(self.user_id, self.display_name)
            .with_media(self.is_audio_enabled, self.is_video_enabled);
        participant.avatar_url = self.avatar_url;
        participant
    }
}

/// `GroupCallStarted` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnnouncement {
    /// Call identifier
    pub call_id: CallId,
    /// Group of the call
    pub group_id: GroupId,
    /// Audio or video
    pub call_type: CallType,
    /// Who started it
    pub initiator_id: UserId,
}

/// `GroupCallEnded` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedNotice {
    /// Call identifier
    pub call_id: CallId,
    /// Who ended it
    #[serde(default)]
    pub ended_by: Option<UserId>,
}

/// `GroupCallParticipantJoined` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedNotice {
    /// Call identifier
    pub call_id: CallId,
    /// Who joined
    pub participant: ParticipantInfo,
}

/// `GroupCallParticipantLeft` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftNotice {
    /// Call identifier
    pub call_id: CallId,
    /// Who left
    pub user_id: UserId,
}

/// `GroupCallMediaToggled` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaToggleNotice {
    /// Call identifier
    pub call_id: CallId,
    /// Who toggled
    pub user_id: UserId,
    /// Which kind
    pub kind: MediaKind,
    /// New state
    pub enabled: bool,
}

/// Addressed negotiation payload (offer, answer or candidate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    /// Call identifier
    pub call_id: CallId,
    /// Sender
    pub from_user_id: UserId,
    /// Recipient
    pub target_user_id: UserId,
    /// SDP or ICE body
    pub payload: P,
}

/// Inbound signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// `GroupCallStarted`
    CallStarted(CallAnnouncement),
    /// `GroupCallEnded`
    CallEnded(CallEndedNotice),
    /// `GroupCallParticipantJoined`
    ParticipantJoined(ParticipantJoinedNotice),
    /// `GroupCallParticipantLeft`
    ParticipantLeft(ParticipantLeftNotice),
    /// `GroupCallMediaToggled`
    MediaToggled(MediaToggleNotice),
    /// `ReceiveGroupCallOffer`
    Offer(Envelope<SessionDescription>),
    /// `ReceiveGroupCallAnswer`
    Answer(Envelope<SessionDescription>),
    /// `ReceiveGroupIceCandidate`
    IceCandidate(Envelope<IceCandidate>),
}

/// Inbound event names, in protocol order
pub const INBOUND_EVENTS: [&str; 8] = [
    "GroupCallStarted",
    "GroupCallEnded",
    "GroupCallParticipantJoined",
    "GroupCallParticipantLeft",
    "GroupCallMediaToggled",
    "ReceiveGroupCallOffer",
    "ReceiveGroupCallAnswer",
    "ReceiveGroupIceCandidate",
];

fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, SignalingError> {
    serde_json::from_value(payload).map_err(|e| SignalingError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

impl SignalingMessage {
    /// Decode a named gateway event
    ///
    /// # Errors
    ///
    /// Returns error for unknown event names or payloads that do not match
    /// the event's schema.
    pub fn from_event(name: &str, payload: Value) -> Result<Self, SignalingError> {
        Ok(match name {
            "GroupCallStarted" => Self::CallStarted(decode(name, payload)?),
            "GroupCallEnded" => Self::CallEnded(decode(name, payload)?),
            "GroupCallParticipantJoined" => Self::ParticipantJoined(decode(name, payload)?),
            "GroupCallParticipantLeft" => Self::ParticipantLeft(decode(name, payload)?),
            "GroupCallMediaToggled" => Self::MediaToggled(decode(name, payload)?),
            "ReceiveGroupCallOffer" => Self::Offer(decode(name, payload)?),
            "ReceiveGroupCallAnswer" => Self::Answer(decode(name, payload)?),
            "ReceiveGroupIceCandidate" => Self::IceCandidate(decode(name, payload)?),
            other => return Err(SignalingError::UnknownEvent(other.to_string())),
        })
    }

    /// Event name this message is delivered under
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CallStarted(_) => "GroupCallStarted",
            Self::CallEnded(_) => "GroupCallEnded",
            Self::ParticipantJoined(_) => "GroupCallParticipantJoined",
            Self::ParticipantLeft(_) => "GroupCallParticipantLeft",
            Self::MediaToggled(_) => "GroupCallMediaToggled",
            Self::Offer(_) => "ReceiveGroupCallOffer",
            Self::Answer(_) => "ReceiveGroupCallAnswer",
            Self::IceCandidate(_) => "ReceiveGroupIceCandidate",
        }
    }

    /// Encode as a named gateway event
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn to_event(&self) -> Result<(&'static str, Value), SignalingError> {
        let payload = match self {
            Self::CallStarted(p) => serde_json::to_value(p),
            Self::CallEnded(p) => serde_json::to_value(p),
            Self::ParticipantJoined(p) => serde_json::to_value(p),
            Self::ParticipantLeft(p) => serde_json::to_value(p),
            Self::MediaToggled(p) => serde_json::to_value(p),
            Self::Offer(p) | Self::Answer(p) => serde_json::to_value(p),
            Self::IceCandidate(p) => serde_json::to_value(p),
        }
        .map_err(|e| SignalingError::InvalidPayload {
            event: self.event_name().to_string(),
            reason: e.to_string(),
        })?;
        Ok((self.event_name(), payload))
    }

    /// Call the message belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::CallStarted(p) => p.call_id,
            Self::CallEnded(p) => p.call_id,
            Self::ParticipantJoined(p) => p.call_id,
            Self::ParticipantLeft(p) => p.call_id,
            Self::MediaToggled(p) => p.call_id,
            Self::Offer(p) | Self::Answer(p) => p.call_id,
            Self::IceCandidate(p) => p.call_id,
        }
    }

    /// Recipient, for addressed negotiation messages
    #[must_use]
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Self::Offer(p) | Self::Answer(p) => Some(&p.target_user_id),
            Self::IceCandidate(p) => Some(&p.target_user_id),
            _ => None,
        }
    }
}

/// Outbound side of the protocol
///
/// Wraps a gateway with the engine's invoke policy:
///
/// - fail fast when the channel is not connected
/// - bound every invoke by `invoke_timeout`
/// - on failure walk through [`GatewayMethod::fallback_names`], limited by
///   the fallback [`RetryPolicy`]
#[derive(Clone)]
pub struct SignalingClient {
    gateway: Arc<dyn SignalingGateway>,
    invoke_timeout: Duration,
    fallback_policy: RetryPolicy,
}

impl SignalingClient {
    /// Create new signaling client
    #[must_use]
    pub fn new(
        gateway: Arc<dyn SignalingGateway>,
        invoke_timeout: Duration,
        fallback_policy: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            invoke_timeout,
            fallback_policy,
        }
    }

    /// Subscribe to gateway events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.gateway.subscribe()
    }

    /// Current gateway connection state
    #[must_use]
    pub fn connection_state(&self) -> GatewayState {
        self.gateway.connection_state()
    }

    /// Invoke a method with timeout and fallback names
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempted name, or
    /// [`SignalingError::Disconnected`] without trying if the channel is down.
    #[tracing::instrument(skip_all, fields(method = method.name()))]
    pub async fn invoke(&self, method: GatewayMethod, args: Vec<Value>) -> Result<(), SignalingError> {
        if self.gateway.connection_state() != GatewayState::Connected {
            tracing::debug!("Gateway disconnected, failing fast");
            return Err(SignalingError::Disconnected);
        }

        let names = method.candidate_names();
        let policy = RetryPolicy {
            max_attempts: self
                .fallback_policy
                .attempts()
                .min(u32::try_from(names.len()).unwrap_or(u32::MAX)),
            ..self.fallback_policy.clone()
        };

        policy
            .run(|attempt| {
                let name = names
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or_else(|| method.name());
                let args = args.clone();
                async move { self.invoke_once(name, args).await }
            })
            .await
            .map_err(|e| {
                tracing::warn!(attempts = e.attempts, error = %e.last, "Invoke failed");
                e.last
            })
    }

    async fn invoke_once(&self, name: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        if self.gateway.connection_state() != GatewayState::Connected {
            return Err(SignalingError::Disconnected);
        }
        tracing::trace!(name, "Invoking");
        match tokio::time::timeout(self.invoke_timeout, self.gateway.invoke(name, args)).await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout(name.to_string())),
        }
    }

    /// `StartGroupCall(groupId, callType)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn start_group_call(
        &self,
        group_id: &GroupId,
        call_type: CallType,
    ) -> Result<(), SignalingError> {
        self.invoke(
            GatewayMethod::StartGroupCall,
            vec![Value::from(group_id.0.clone()), Value::from(call_type.as_str())],
        )
        .await
    }

    /// `JoinGroupCall(callId)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn join_group_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::JoinGroupCall, vec![Value::from(call_id.to_string())])
            .await
    }

    /// `LeaveGroupCall(callId)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn leave_group_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::LeaveGroupCall, vec![Value::from(call_id.to_string())])
            .await
    }

    /// `EndGroupCall(callId)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn end_group_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::EndGroupCall, vec![Value::from(call_id.to_string())])
            .await
    }

    /// `ToggleGroupCallMedia(callId, kind, enabled)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn toggle_media(
        &self,
        call_id: CallId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), SignalingError> {
        self.invoke(
            GatewayMethod::ToggleGroupCallMedia,
            vec![
                Value::from(call_id.to_string()),
                Value::from(kind.as_str()),
                Value::from(enabled),
            ],
        )
        .await
    }

    /// `SendGroupCallOffer(envelope)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn send_offer(
        &self,
        envelope: &Envelope<SessionDescription>,
    ) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::SendGroupCallOffer, vec![encode(envelope)?])
            .await
    }

    /// `SendGroupCallAnswer(envelope)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn send_answer(
        &self,
        envelope: &Envelope<SessionDescription>,
    ) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::SendGroupCallAnswer, vec![encode(envelope)?])
            .await
    }

    /// `SendGroupIceCandidate(envelope)`
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::invoke`]
    pub async fn send_ice_candidate(
        &self,
        envelope: &Envelope<IceCandidate>,
    ) -> Result<(), SignalingError> {
        self.invoke(GatewayMethod::SendGroupIceCandidate, vec![encode(envelope)?])
            .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(value).map_err(|e| SignalingError::InvalidPayload {
        event: "outbound".to_string(),
        reason: e.to_string(),
    })
}

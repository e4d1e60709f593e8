//! In-process signaling hub and synthetic capture devices
//!
//! [`LoopbackHub`] plays the server side of the group call protocol for
//! engines living in the same process: it relays invokes as events between
//! the [`LoopbackGateway`]s it hands out and answers [`CallDirectory`]
//! queries from the same bookkeeping. The CLI simulation and the test suite
//! run whole meshes on it.

use crate::directory::{ActiveCallInfo, CallDirectory, DirectoryError};
use crate::identity::{LocalUser, UserId};
use crate::media::{CaptureConstraints, LocalTrack, MediaDevices, MediaError};
use crate::signaling::{
    CallAnnouncement, CallEndedNotice, Envelope, GatewayEvent, GatewayMethod, GatewayState,
    MediaToggleNotice, ParticipantInfo, ParticipantJoinedNotice, ParticipantLeftNotice,
    SignalingError, SignalingGateway, SignalingMessage,
};
use crate::types::{CallId, CallType, GroupId, IceServer, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const MEMBER_CHANNEL_CAPACITY: usize = 512;

struct Member {
    profile: LocalUser,
    events: broadcast::Sender<GatewayEvent>,
    connected: bool,
}

struct HubCall {
    info: ActiveCallInfo,
}

impl HubCall {
    fn has(&self, user: &UserId) -> bool {
        self.info.participants.iter().any(|p| &p.user_id == user)
    }
}

#[derive(Default)]
struct HubState {
    members: HashMap<UserId, Member>,
    calls: HashMap<CallId, HubCall>,
    groups: HashMap<GroupId, CallId>,
}

impl HubState {
    fn info_for(&self, user: &UserId) -> ParticipantInfo {
        let profile = self.members.get(user).map(|m| &m.profile);
        ParticipantInfo {
            user_id: user.clone(),
            display_name: profile.map_or_else(|| user.to_string(), |p| p.display_name.clone()),
            avatar_url: profile.and_then(|p| p.avatar_url.clone()),
            is_audio_enabled: true,
            is_video_enabled: false,
        }
    }

    fn register_call(&mut self, group_id: &GroupId, call_type: CallType, initiator: &UserId) -> CallId {
        let call_id = CallId::new();
        let info = ActiveCallInfo {
            call_id,
            group_id: group_id.clone(),
            call_type,
            initiator_id: initiator.clone(),
            participants: vec![self.info_for(initiator)],
        };
        self.calls.insert(call_id, HubCall { info });
        self.groups.insert(group_id.clone(), call_id);
        call_id
    }

    fn remove_call(&mut self, call_id: CallId) -> Option<HubCall> {
        let call = self.calls.remove(&call_id)?;
        if self.groups.get(&call.info.group_id) == Some(&call_id) {
            self.groups.remove(&call.info.group_id);
        }
        Some(call)
    }

    /// Deliver to every connected member except `except`
    fn broadcast(&self, message: &SignalingMessage, except: Option<&UserId>) {
        let Ok((name, payload)) = message.to_event() else {
            return;
        };
        for (user, member) in &self.members {
            if Some(user) == except || !member.connected {
                continue;
            }
            let _ = member.events.send(GatewayEvent::Message {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
    }

    fn deliver(&self, to: &UserId, message: &SignalingMessage) {
        let Some(member) = self.members.get(to).filter(|m| m.connected) else {
            tracing::debug!(target_user = %to, "Dropping message for absent member");
            return;
        };
        if let Ok((name, payload)) = message.to_event() {
            let _ = member.events.send(GatewayEvent::Message {
                name: name.to_string(),
                payload,
            });
        }
    }
}

/// In-memory group call server
///
/// Implements [`CallDirectory`] itself; [`LoopbackHub::connect`] hands out
/// one [`SignalingGateway`] per user.
pub struct LoopbackHub {
    state: Mutex<HubState>,
    ice_servers: Vec<IceServer>,
}

impl LoopbackHub {
    /// Create a hub that advertises no ICE servers
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_ice_servers(Vec::new())
    }

    /// Create a hub advertising `ice_servers` through the directory
    #[must_use]
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            ice_servers,
        })
    }

    /// Register `user` and return its gateway
    ///
    /// Connecting the same user twice replaces the earlier gateway's channel.
    #[must_use]
    pub fn connect(self: &Arc<Self>, user: &LocalUser) -> Arc<LoopbackGateway> {
        let (events, _) = broadcast::channel(MEMBER_CHANNEL_CAPACITY);
        self.state.lock().members.insert(
            user.id.clone(),
            Member {
                profile: user.clone(),
                events: events.clone(),
                connected: true,
            },
        );
        tracing::debug!(user = %user.id, "Member connected to loopback hub");
        Arc::new(LoopbackGateway {
            hub: Arc::clone(self),
            user: user.id.clone(),
            events,
        })
    }

    /// Drop or restore a member's channel
    ///
    /// Emits [`GatewayEvent::Disconnected`] or [`GatewayEvent::Reconnected`]
    /// to that member when the state actually changes.
    pub fn set_connected(&self, user: &UserId, connected: bool) {
        let mut state = self.state.lock();
        let Some(member) = state.members.get_mut(user) else {
            return;
        };
        if member.connected == connected {
            return;
        }
        member.connected = connected;
        let event = if connected {
            GatewayEvent::Reconnected
        } else {
            GatewayEvent::Disconnected
        };
        tracing::info!(user = %user, connected, "Loopback member connectivity changed");
        let _ = member.events.send(event);
    }

    /// Participants the hub has registered for `call_id`
    #[must_use]
    pub fn participants(&self, call_id: CallId) -> Vec<UserId> {
        self.state
            .lock()
            .calls
            .get(&call_id)
            .map(|c| c.info.participants.iter().map(|p| p.user_id.clone()).collect())
            .unwrap_or_default()
    }

    fn dispatch(&self, from: &UserId, method: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        let Some(method) = method_by_name(method) else {
            return Err(SignalingError::MethodUnsupported(method.to_string()));
        };
        let mut state = self.state.lock();

        match method {
            GatewayMethod::StartGroupCall => {
                let group_id = GroupId::new(arg::<String>(&args, 0, method)?);
                let call_type = arg::<CallType>(&args, 1, method)?;
                let existing = state.groups.get(&group_id).copied();
                let call_id = match existing {
                    Some(id) => id,
                    None => state.register_call(&group_id, call_type, from),
                };
                let initiator_id = state
                    .calls
                    .get(&call_id)
                    .map_or_else(|| from.clone(), |c| c.info.initiator_id.clone());
                state.broadcast(
                    &SignalingMessage::CallStarted(CallAnnouncement {
                        call_id,
                        group_id,
                        call_type,
                        initiator_id,
                    }),
                    None,
                );
            }
            GatewayMethod::JoinGroupCall => {
                let call_id = arg::<CallId>(&args, 0, method)?;
                let participant = state.info_for(from);
                let Some(call) = state.calls.get_mut(&call_id) else {
                    return Err(SignalingError::TransportError(format!("no call {call_id}")));
                };
                if !call.has(from) {
                    call.info.participants.push(participant.clone());
                }
                state.broadcast(
                    &SignalingMessage::ParticipantJoined(ParticipantJoinedNotice {
                        call_id,
                        participant,
                    }),
                    Some(from),
                );
            }
            GatewayMethod::LeaveGroupCall => {
                let call_id = arg::<CallId>(&args, 0, method)?;
                let empty = match state.calls.get_mut(&call_id) {
                    Some(call) => {
                        call.info.participants.retain(|p| &p.user_id != from);
                        call.info.participants.is_empty()
                    }
                    None => return Ok(()),
                };
                if empty {
                    state.remove_call(call_id);
                }
                state.broadcast(
                    &SignalingMessage::ParticipantLeft(ParticipantLeftNotice {
                        call_id,
                        user_id: from.clone(),
                    }),
                    Some(from),
                );
            }
            GatewayMethod::EndGroupCall => {
                let call_id = arg::<CallId>(&args, 0, method)?;
                if state.remove_call(call_id).is_some() {
                    state.broadcast(
                        &SignalingMessage::CallEnded(CallEndedNotice {
                            call_id,
                            ended_by: Some(from.clone()),
                        }),
                        Some(from),
                    );
                }
            }
            GatewayMethod::ToggleGroupCallMedia => {
                let call_id = arg::<CallId>(&args, 0, method)?;
                let kind = arg::<MediaKind>(&args, 1, method)?;
                let enabled = arg::<bool>(&args, 2, method)?;
                if let Some(p) = state
                    .calls
                    .get_mut(&call_id)
                    .and_then(|c| c.info.participants.iter_mut().find(|p| &p.user_id == from))
                {
                    match kind {
                        MediaKind::Audio => p.is_audio_enabled = enabled,
                        MediaKind::Video => p.is_video_enabled = enabled,
                    }
                }
                state.broadcast(
                    &SignalingMessage::MediaToggled(MediaToggleNotice {
                        call_id,
                        user_id: from.clone(),
                        kind,
                        enabled,
                    }),
                    Some(from),
                );
            }
            GatewayMethod::SendGroupCallOffer | GatewayMethod::SendGroupCallAnswer => {
                let envelope: Envelope<_> = arg(&args, 0, method)?;
                let target = envelope.target_user_id.clone();
                let message = if method == GatewayMethod::SendGroupCallOffer {
                    SignalingMessage::Offer(envelope)
                } else {
                    SignalingMessage::Answer(envelope)
                };
                state.deliver(&target, &message);
            }
            GatewayMethod::SendGroupIceCandidate => {
                let envelope: Envelope<_> = arg(&args, 0, method)?;
                let target = envelope.target_user_id.clone();
                state.deliver(&target, &SignalingMessage::IceCandidate(envelope));
            }
        }
        Ok(())
    }
}

fn method_by_name(name: &str) -> Option<GatewayMethod> {
    [
        GatewayMethod::StartGroupCall,
        GatewayMethod::JoinGroupCall,
        GatewayMethod::LeaveGroupCall,
        GatewayMethod::EndGroupCall,
        GatewayMethod::ToggleGroupCallMedia,
        GatewayMethod::SendGroupCallOffer,
        GatewayMethod::SendGroupCallAnswer,
        GatewayMethod::SendGroupIceCandidate,
    ]
    .into_iter()
    .find(|m| m.name() == name)
}

fn arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    method: GatewayMethod,
) -> Result<T, SignalingError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| SignalingError::InvalidPayload {
        event: method.name().to_string(),
        reason: format!("argument {index}: {e}"),
    })
}

#[async_trait]
impl CallDirectory for LoopbackHub {
    async fn active_call(&self, group_id: &GroupId) -> Result<Option<ActiveCallInfo>, DirectoryError> {
        let state = self.state.lock();
        Ok(state
            .groups
            .get(group_id)
            .and_then(|id| state.calls.get(id))
            .map(|c| c.info.clone()))
    }

    async fn create_call(
        &self,
        group_id: &GroupId,
        call_type: CallType,
        initiator: &LocalUser,
    ) -> Result<ActiveCallInfo, DirectoryError> {
        let mut state = self.state.lock();
        let call_id = state.register_call(group_id, call_type, &initiator.id);
        state
            .calls
            .get(&call_id)
            .map(|c| c.info.clone())
            .ok_or_else(|| DirectoryError::CallNotFound(call_id.to_string()))
    }

    async fn join_call(&self, call_id: CallId, user: &LocalUser) -> Result<ActiveCallInfo, DirectoryError> {
        let mut state = self.state.lock();
        let participant = state.info_for(&user.id);
        let call = state
            .calls
            .get_mut(&call_id)
            .ok_or_else(|| DirectoryError::CallNotFound(call_id.to_string()))?;
        let before = call.info.clone();
        if !call.has(&user.id) {
            call.info.participants.push(participant);
        }
        Ok(before)
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>, DirectoryError> {
        Ok(self.ice_servers.clone())
    }
}

/// One user's connection to a [`LoopbackHub`]
pub struct LoopbackGateway {
    hub: Arc<LoopbackHub>,
    user: UserId,
    events: broadcast::Sender<GatewayEvent>,
}

impl LoopbackGateway {
    /// User this gateway belongs to
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl SignalingGateway for LoopbackGateway {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        if self.connection_state() != GatewayState::Connected {
            return Err(SignalingError::Disconnected);
        }
        tracing::trace!(user = %self.user, method, "Loopback invoke");
        self.hub.dispatch(&self.user, method, args)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn connection_state(&self) -> GatewayState {
        match self.hub.state.lock().members.get(&self.user) {
            Some(member) if member.connected => GatewayState::Connected,
            _ => GatewayState::Disconnected,
        }
    }
}

/// Capture devices producing placeholder tracks
///
/// Camera and microphone can be unplugged to exercise the fallback paths.
#[derive(Debug)]
pub struct SyntheticDevices {
    camera: AtomicBool,
    microphone: AtomicBool,
    captures: AtomicUsize,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl SyntheticDevices {
    /// Devices with both camera and microphone present
    #[must_use]
    pub fn new() -> Self {
        Self {
            camera: AtomicBool::new(true),
            microphone: AtomicBool::new(true),
            captures: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Plug or unplug the camera
    pub fn set_camera_available(&self, available: bool) {
        self.camera.store(available, Ordering::SeqCst);
    }

    /// Plug or unplug the microphone
    pub fn set_microphone_available(&self, available: bool) {
        self.microphone.store(available, Ordering::SeqCst);
    }

    /// Successful captures so far
    #[must_use]
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Every track handed out so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().clone()
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            if !self.microphone.load(Ordering::SeqCst) {
                return Err(MediaError::DeviceNotFound("microphone".into()));
            }
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, "Synthetic microphone")));
        }
        if constraints.video.is_some() {
            if !self.camera.load(Ordering::SeqCst) {
                return Err(MediaError::DeviceNotFound("camera".into()));
            }
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, "Synthetic camera")));
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::SessionDescription;
    use pretty_assertions::assert_eq;

    fn next_message(rx: &mut broadcast::Receiver<GatewayEvent>) -> SignalingMessage {
        match rx.try_recv().unwrap() {
            GatewayEvent::Message { name, payload } => {
                SignalingMessage::from_event(&name, payload).unwrap()
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_announces_registered_call_to_everyone() {
        let hub = LoopbackHub::new();
        let alice = LocalUser::new("alice", "Alice");
        let a = hub.connect(&alice);
        let b = hub.connect(&LocalUser::new("bob", "Bob"));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        let group = GroupId::new("g1");
        let info = hub.create_call(&group, CallType::Audio, &alice).await.unwrap();
        tokio_test::assert_ok!(
            a.invoke("StartGroupCall", vec![Value::from("g1"), Value::from("audio")])
                .await
        );

        for rx in [&mut rx_a, &mut rx_b] {
            match next_message(rx) {
                SignalingMessage::CallStarted(announcement) => {
                    assert_eq!(announcement.call_id, info.call_id);
                    assert_eq!(announcement.initiator_id, alice.id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_directory_join_returns_participants_before_join() {
        let hub = LoopbackHub::new();
        let alice = LocalUser::new("alice", "Alice");
        let bob = LocalUser::new("bob", "Bob");
        let _a = hub.connect(&alice);
        let _b = hub.connect(&bob);

        let info = hub
            .create_call(&GroupId::new("g1"), CallType::Video, &alice)
            .await
            .unwrap();
        let before = hub.join_call(info.call_id, &bob).await.unwrap();

        assert_eq!(before.participants.len(), 1);
        assert_eq!(hub.participants(info.call_id), vec![alice.id, bob.id]);
    }

    #[tokio::test]
    async fn test_offers_reach_only_their_target() {
        let hub = LoopbackHub::new();
        let a = hub.connect(&LocalUser::new("alice", "Alice"));
        let b = hub.connect(&LocalUser::new("bob", "Bob"));
        let c = hub.connect(&LocalUser::new("carol", "Carol"));
        let mut rx_b = b.subscribe();
        let mut rx_c = c.subscribe();

        let envelope = Envelope {
            call_id: CallId::new(),
            from_user_id: UserId::new("alice"),
            target_user_id: UserId::new("bob"),
            payload: SessionDescription::offer("v=0"),
        };
        tokio_test::assert_ok!(
            a.invoke("SendGroupCallOffer", vec![serde_json::to_value(&envelope).unwrap()])
                .await
        );

        assert_eq!(next_message(&mut rx_b), SignalingMessage::Offer(envelope));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_member_fails_fast_and_is_notified() {
        let hub = LoopbackHub::new();
        let a = hub.connect(&LocalUser::new("alice", "Alice"));
        let mut rx = a.subscribe();

        hub.set_connected(a.user(), false);
        assert_eq!(a.connection_state(), GatewayState::Disconnected);
        assert_eq!(
            a.invoke("JoinGroupCall", vec![]).await,
            Err(SignalingError::Disconnected)
        );
        hub.set_connected(a.user(), true);

        assert_eq!(rx.try_recv().unwrap(), GatewayEvent::Disconnected);
        assert_eq!(rx.try_recv().unwrap(), GatewayEvent::Reconnected);
    }

    #[tokio::test]
    async fn test_unknown_method_is_unsupported() {
        let hub = LoopbackHub::new();
        let a = hub.connect(&LocalUser::new("alice", "Alice"));
        assert_eq!(
            a.invoke("JoinCall", vec![]).await,
            Err(SignalingError::MethodUnsupported("JoinCall".into()))
        );
    }

    #[tokio::test]
    async fn test_synthetic_devices_without_camera() {
        let devices = SyntheticDevices::new();
        devices.set_camera_available(false);

        let err = devices
            .get_user_media(&CaptureConstraints::for_call(true))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::DeviceNotFound("camera".into()));

        let tracks = devices
            .get_user_media(&CaptureConstraints::audio_only())
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(devices.captures(), 1);
    }
}

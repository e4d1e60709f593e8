//! Shared fakes for the integration tests
//!
//! A [`Node`] is one engine on a [`LoopbackHub`] with a recording gateway, a
//! scripted directory and fake peer connections. Fake peers describe their
//! local tracks in the SDP they produce, so remote streams show up on the
//! other side once offers and answers have been exchanged.

#![allow(dead_code)]

use async_trait::async_trait;
use meshcall_core::directory::{ActiveCallInfo, CallDirectory, DirectoryError};
use meshcall_core::loopback::{LoopbackGateway, LoopbackHub, SyntheticDevices};
use meshcall_core::peer::{PeerError, PeerEventSink, PeerFactory, RtcPeer};
use meshcall_core::signaling::{GatewayEvent, GatewayState, SignalingError, SignalingGateway};
use meshcall_core::{
    CallEngine, CallId, CallType, EngineConfig, GroupId, IceCandidate, IceServer, LocalTrack,
    LocalUser, MediaKind, PeerConnectionState, RemoteTrackInfo, RetryPolicy, SessionDescription,
    UserId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Gateway wrapper recording every invoke, failing or stalling chosen methods
pub struct RecordingGateway {
    inner: Arc<LoopbackGateway>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
}

impl RecordingGateway {
    pub fn new(inner: Arc<LoopbackGateway>) -> Self {
        Self {
            inner,
            invocations: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
        }
    }

    /// Make every invoke of `method` fail with a transport error
    pub fn fail(&self, method: &str) {
        self.failing.lock().insert(method.to_string());
    }

    /// Make every invoke of `method` hang until the caller gives up
    pub fn stall(&self, method: &str) {
        self.stalled.lock().insert(method.to_string());
    }

    pub fn count(&self, method: &str) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn args_of(&self, method: &str) -> Vec<Vec<Value>> {
        self.invocations
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.invocations.lock().clear();
    }
}

#[async_trait]
impl SignalingGateway for RecordingGateway {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        self.invocations
            .lock()
            .push((method.to_string(), args.clone()));
        if self.failing.lock().contains(method) {
            return Err(SignalingError::TransportError(format!("{method} refused")));
        }
        if self.stalled.lock().contains(method) {
            return std::future::pending().await;
        }
        self.inner.invoke(method, args).await
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.subscribe()
    }

    fn connection_state(&self) -> GatewayState {
        self.inner.connection_state()
    }
}

/// Directory wrapper counting joins, with optional failures and delay
pub struct ScriptedDirectory {
    inner: Arc<LoopbackHub>,
    joins: AtomicUsize,
    join_delay: Mutex<Duration>,
    fail_lookup: AtomicBool,
}

impl ScriptedDirectory {
    pub fn new(inner: Arc<LoopbackHub>) -> Self {
        Self {
            inner,
            joins: AtomicUsize::new(0),
            join_delay: Mutex::new(Duration::ZERO),
            fail_lookup: AtomicBool::new(false),
        }
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn delay_joins(&self, delay: Duration) {
        *self.join_delay.lock() = delay;
    }

    pub fn fail_lookups(&self) {
        self.fail_lookup.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallDirectory for ScriptedDirectory {
    async fn active_call(&self, group_id: &GroupId) -> Result<Option<ActiveCallInfo>, DirectoryError> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(DirectoryError::RequestFailed("lookup unavailable".into()));
        }
        self.inner.active_call(group_id).await
    }

    async fn create_call(
        &self,
        group_id: &GroupId,
        call_type: CallType,
        initiator: &LocalUser,
    ) -> Result<ActiveCallInfo, DirectoryError> {
        self.inner.create_call(group_id, call_type, initiator).await
    }

    async fn join_call(&self, call_id: CallId, user: &LocalUser) -> Result<ActiveCallInfo, DirectoryError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let delay = *self.join_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.join_call(call_id, user).await
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>, DirectoryError> {
        self.inner.ice_servers().await
    }
}

/// Peer connection that advertises its tracks as `track:<kind>:<id>` lines
pub struct FakePeer {
    remote: UserId,
    sink: PeerEventSink,
    tracks: Mutex<Vec<(MediaKind, String)>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    candidates_sent: AtomicUsize,
    applied: Mutex<Vec<IceCandidate>>,
    seen_tracks: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl FakePeer {
    fn sdp(&self, kind: &str) -> String {
        let mut sdp = format!("v=0 {kind}\n");
        for (media, id) in self.tracks.lock().iter() {
            sdp.push_str(&format!("track:{media}:{id}\n"));
        }
        sdp
    }

    fn maybe_connected(&self) {
        if self.has_local.load(Ordering::SeqCst) && self.has_remote.load(Ordering::SeqCst) {
            self.sink.state_changed(PeerConnectionState::Connected);
        }
    }

    /// Report a link state as the media engine would
    pub fn report(&self, state: PeerConnectionState) {
        self.sink.state_changed(state);
    }

    pub fn applied(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }
}

#[async_trait]
impl RtcPeer for FakePeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.tracks
            .lock()
            .push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        self.tracks.lock().retain(|(_, id)| id != track_id);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<(), PeerError> {
        let first = !self.has_local.swap(true, Ordering::SeqCst);
        if first {
            let n = self.candidates_sent.fetch_add(1, Ordering::SeqCst);
            self.sink.local_candidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
                50000 + n
            )));
        }
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        for line in description.sdp.lines() {
            let mut parts = line.splitn(3, ':');
            if parts.next() != Some("track") {
                continue;
            }
            let kind = match parts.next() {
                Some("video") => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            let Some(id) = parts.next() else { continue };
            if self.seen_tracks.lock().insert(id.to_string()) {
                self.sink.remote_track(RemoteTrackInfo {
                    track_id: id.to_string(),
                    kind,
                });
            }
        }
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connected();
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(PeerError::Negotiation("candidate before remote description".into()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory keeping every peer it created
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    /// Latest connection created towards `remote`
    pub fn peer_for(&self, remote: &str) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|p| p.remote.as_str() == remote)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_peer(
        &self,
        participant: &UserId,
        _ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        let peer = Arc::new(FakePeer {
            remote: participant.clone(),
            sink: events,
            tracks: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            candidates_sent: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            seen_tracks: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

/// One participant of a test mesh
pub struct Node {
    pub user: LocalUser,
    pub engine: CallEngine,
    pub gateway: Arc<RecordingGateway>,
    pub directory: Arc<ScriptedDirectory>,
    pub devices: Arc<SyntheticDevices>,
    pub peers: Arc<FakePeerFactory>,
}

impl Node {
    pub fn id(&self) -> &UserId {
        &self.user.id
    }

    pub async fn connections(&self) -> usize {
        self.engine.orchestrator().connection_count().await
    }

    /// Every track captured for this node has ended
    pub fn all_tracks_ended(&self) -> bool {
        self.devices
            .issued_tracks()
            .iter()
            .all(|t| t.ready_state() == meshcall_core::media::TrackReadyState::Ended)
    }
}

/// Config with short rejoin delays so tests do not wait on backoff
pub fn test_config(user: &LocalUser) -> EngineConfig {
    let mut config = EngineConfig {
        local_user: user.clone(),
        ..EngineConfig::default()
    };
    config.call.rejoin_retry = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        backoff_factor: 2,
        max_delay: Duration::from_millis(40),
    };
    config.call.default_ice_servers = Vec::new();
    config
}

pub fn node(hub: &Arc<LoopbackHub>, name: &str) -> Node {
    let user = LocalUser::new(name, name.to_uppercase());
    node_with(hub, test_config(&user))
}

pub fn node_with(hub: &Arc<LoopbackHub>, config: EngineConfig) -> Node {
    let user = config.local_user.clone();
    let gateway = Arc::new(RecordingGateway::new(hub.connect(&user)));
    let directory = Arc::new(ScriptedDirectory::new(hub.clone()));
    let devices = Arc::new(SyntheticDevices::new());
    let peers = Arc::new(FakePeerFactory::default());

    let engine = CallEngine::builder()
        .with_config(config)
        .with_gateway(gateway.clone())
        .with_directory(directory.clone())
        .with_devices(devices.clone())
        .with_peer_factory(peers.clone())
        .build()
        .unwrap();
    engine.start().unwrap();

    Node {
        user,
        engine,
        gateway,
        directory,
        devices,
        peers,
    }
}

/// Re-evaluate `$check` every 10ms until it holds, failing after two seconds
///
/// `$check` may await.
#[allow(unused_macros)]
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let mut satisfied = false;
        for _ in 0..200 {
            if $check {
                satisfied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(satisfied, "timed out waiting for {}", $what);
    }};
}

/// Events received so far
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Count of remote tracks per participant as seen by `node`
pub fn remote_tracks(node: &Node) -> HashMap<UserId, usize> {
    node.engine
        .orchestrator()
        .remote_streams()
        .into_iter()
        .map(|(user, stream)| (user, stream.tracks.len()))
        .collect()
}

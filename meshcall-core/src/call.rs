//! Call session orchestration
//!
//! [`CallOrchestrator`] owns the session: the current [`Call`], the
//! connecting-lock that admits a single start or join at a time, and the
//! snapshots published to observers. Everything else (media, connections,
//! signaling, the directory) is a collaborator it drives.
//!
//! # Session flow
//!
//! ```text
//!   Idle ── start_call ──► Connecting(Outgoing) ──► Active ──► Ended
//!     │                          │ (group has a call)   ▲
//!     │                          ▼                      │
//!     └── GroupCallStarted ─► Connecting(Incoming) ── join_call
//! ```
//!
//! Inbound signaling and connection events are fed in by the engine's
//! dispatch loop through [`CallOrchestrator::handle_gateway_event`] and
//! [`CallOrchestrator::handle_peer_event`].

use crate::directory::{ActiveCallInfo, CallDirectory};
use crate::identity::{LocalUser, UserId};
use crate::media::{MediaController, MediaError};
use crate::outbox::{Outbound, SignalOutbox};
use crate::peer::{PeerConnectionManager, PeerError, PeerEvent, PeerUpdate};
use crate::retry::RetryPolicy;
use crate::signaling::{
    CallAnnouncement, CallEndedNotice, Envelope, GatewayEvent, MediaToggleNotice,
    ParticipantJoinedNotice, ParticipantLeftNotice, SignalingClient, SignalingMessage,
};
use crate::types::{
    default_ice_servers, duration_ms, Call, CallDirection, CallEvent, CallId, CallState, CallType,
    ConnectionQuality, GroupId, IceCandidate, IceServer, MediaKind, Participant,
    PeerConnectionState, RemoteStream, SdpType, SessionDescription, SessionSnapshot,
};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Call errors surfaced to the application
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Local media could not be captured at all
    #[error("Media acquisition failed: {0}")]
    Media(#[from] MediaError),

    /// Only the initiator may end a call for everyone
    #[error("Only the initiator can end the call")]
    NotInitiator,

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Already in another call
    #[error("Already in call {0}")]
    Busy(CallId),

    /// The call to join is unknown to the directory and to us
    #[error("Unknown call {0}")]
    UnknownCall(CallId),

    /// The directory did not confirm the join in time
    #[error("Join of call {0} timed out")]
    JoinTimedOut(CallId),
}

/// Result of a start or join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A new call was created
    Started(CallId),
    /// Our own active call was reused and re-announced
    Reused(CallId),
    /// Joined an existing call
    Joined(CallId),
    /// Already active in that call
    AlreadyActive(CallId),
    /// Another start or join holds the connecting-lock
    AlreadyConnecting,
    /// Leave or end interrupted the attempt
    Cancelled,
}

impl CallOutcome {
    /// Call the outcome refers to, if any
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Started(id) | Self::Reused(id) | Self::Joined(id) | Self::AlreadyActive(id) => {
                Some(*id)
            }
            Self::AlreadyConnecting | Self::Cancelled => None,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Bound on a single signaling invoke
    #[serde(with = "duration_ms")]
    pub invoke_timeout: Duration,
    /// Bound on the join handshake
    #[serde(with = "duration_ms")]
    pub join_timeout: Duration,
    /// How long a broken link may stay broken before eviction
    #[serde(with = "duration_ms")]
    pub eviction_grace: Duration,
    /// Fallback method names policy
    pub invoke_retry: RetryPolicy,
    /// Membership re-registration after a reconnect
    pub rejoin_retry: RetryPolicy,
    /// STUN/TURN servers used when the directory has none
    pub default_ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
            eviction_grace: Duration::from_secs(15),
            invoke_retry: RetryPolicy::fallback_names(),
            rejoin_retry: RetryPolicy::rejoin(),
            default_ice_servers: default_ice_servers(),
        }
    }
}

/// Collaborators the orchestrator drives
pub struct CallContext {
    /// Local profile
    pub local_user: LocalUser,
    /// Outbound signaling
    pub signaling: SignalingClient,
    /// REST side
    pub directory: Arc<dyn CallDirectory>,
    /// Local capture
    pub media: Arc<MediaController>,
    /// Peer connections
    pub peers: Arc<PeerConnectionManager>,
}

enum FlowError {
    Cancelled,
    Failed(CallError),
}

impl From<CallError> for FlowError {
    fn from(err: CallError) -> Self {
        Self::Failed(err)
    }
}

async fn guarded<T>(
    token: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, FlowError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(FlowError::Cancelled),
        out = fut => Ok(out),
    }
}

struct Attempt {
    id: u64,
    call_id: Option<CallId>,
    token: CancellationToken,
}

struct Session {
    state: CallState,
    call: Option<Call>,
    attempt: Option<Attempt>,
    attempt_seq: u64,
    camera_unavailable: bool,
    degraded: bool,
    evictions: HashMap<UserId, u64>,
    eviction_seq: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            state: CallState::Idle,
            call: None,
            attempt: None,
            attempt_seq: 0,
            camera_unavailable: false,
            degraded: false,
            evictions: HashMap::new(),
            eviction_seq: 0,
        }
    }

    fn transition(&mut self, to: CallState) -> bool {
        if !self.state.can_transition_to(to) {
            tracing::debug!(from = ?self.state, to = ?to, "Ignoring invalid session transition");
            return false;
        }
        let old_state = self.state;
        self.state = to;
        if let Some(call) = self.call.as_mut() {
            call.transition(to);
        }
        tracing::debug!(old_state = ?old_state, new_state = ?to, "Session state transition");
        true
    }

    /// Forget an ended call so a fresh instance can begin
    fn reset_if_ended(&mut self) {
        if self.state.is_terminal() {
            self.state = CallState::Idle;
            self.call = None;
            self.camera_unavailable = false;
            self.degraded = false;
            self.evictions.clear();
        }
    }

    /// Drop a pending incoming call that was never joined
    fn discard_pending(&mut self) {
        if matches!(self.state, CallState::Connecting(CallDirection::Incoming))
            && self.attempt.is_none()
        {
            self.state = CallState::Idle;
            self.call = None;
        }
    }

    fn begin_attempt(&mut self, call_id: Option<CallId>) -> (u64, CancellationToken) {
        self.attempt_seq += 1;
        let token = CancellationToken::new();
        self.attempt = Some(Attempt {
            id: self.attempt_seq,
            call_id,
            token: token.clone(),
        });
        (self.attempt_seq, token)
    }

    fn cancel_attempt(&mut self) -> bool {
        match self.attempt.take() {
            Some(attempt) => {
                attempt.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Current call, unless it has ended
    fn live_call(&self) -> Option<&Call> {
        self.call.as_ref().filter(|_| !self.state.is_terminal())
    }

    fn live_call_mut(&mut self, call_id: CallId) -> Option<&mut Call> {
        if self.state.is_terminal() {
            return None;
        }
        self.call.as_mut().filter(|c| c.id == call_id)
    }

    fn active_call_id(&self) -> Option<CallId> {
        match self.state {
            CallState::Active => self.call.as_ref().map(|c| c.id),
            _ => None,
        }
    }

    fn joining(&self, call_id: CallId) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.call_id == Some(call_id))
    }

    /// Negotiation traffic is only accepted for an active call or the call
    /// we are currently joining
    fn accepts_negotiation(&self, call_id: CallId) -> bool {
        self.active_call_id() == Some(call_id) || self.joining(call_id)
    }

    fn negotiating_call(&self) -> Option<CallId> {
        self.active_call_id()
            .or_else(|| self.attempt.as_ref().and_then(|a| a.call_id))
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            call: self.call.clone(),
            camera_unavailable: self.camera_unavailable,
            degraded: self.degraded,
        }
    }
}

/// Top-level call state machine
///
/// The only API the application talks to. Start, join, leave and end are
/// safe to call concurrently: the connecting-lock admits one start or join,
/// and leave or end cancel it.
pub struct CallOrchestrator {
    this: Weak<Self>,
    local_user: LocalUser,
    signaling: SignalingClient,
    outbox: SignalOutbox,
    directory: Arc<dyn CallDirectory>,
    media: Arc<MediaController>,
    peers: Arc<PeerConnectionManager>,
    config: CallConfig,
    session: Mutex<Session>,
    events: broadcast::Sender<CallEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl CallOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(context: CallContext, config: CallConfig, event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let CallContext {
            local_user,
            signaling,
            directory,
            media,
            peers,
        } = context;

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_user,
            outbox: SignalOutbox::new(signaling.clone()),
            signaling,
            directory,
            media,
            peers,
            config,
            session: Mutex::new(Session::new()),
            events,
            snapshots,
        })
    }

    /// Local profile
    #[must_use]
    pub fn local_user(&self) -> &LocalUser {
        &self.local_user
    }

    /// Outbound signaling client
    #[must_use]
    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    /// Local media controller
    #[must_use]
    pub fn media(&self) -> &Arc<MediaController> {
        &self.media
    }

    /// Peer connection manager
    #[must_use]
    pub fn peers(&self) -> &Arc<PeerConnectionManager> {
        &self.peers
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Current session snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.session.lock().state
    }

    /// Observe session snapshots
    #[must_use]
    pub fn on_state_change(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Remote streams keyed by participant
    #[must_use]
    pub fn remote_streams(&self) -> HashMap<UserId, RemoteStream> {
        self.peers.remote_streams()
    }

    /// Number of peer connections
    pub async fn connection_count(&self) -> usize {
        self.peers.entry_count().await
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot.clone());
        self.emit(CallEvent::StateChanged { snapshot });
    }

    fn local_participant(&self) -> Participant {
        let mut participant =
            Participant::new(self.local_user.id.clone(), self.local_user.display_name.clone())
                .with_media(
                    self.media.is_enabled(MediaKind::Audio).unwrap_or(false),
                    self.media.is_enabled(MediaKind::Video).unwrap_or(false),
                );
        participant.avatar_url = self.local_user.avatar_url.clone();
        participant.connection_quality = ConnectionQuality::Good;
        participant
    }

    /// Start a call in `group_id`, or reuse / join the one already there
    ///
    /// # Errors
    ///
    /// [`CallError::Media`] when no audio can be captured,
    /// [`CallError::Busy`] when active in another group's call.
    #[tracing::instrument(skip_all, fields(group_id = %group_id, call_type = call_type.as_str()))]
    pub async fn start_call(
        &self,
        group_id: GroupId,
        call_type: CallType,
    ) -> Result<CallOutcome, CallError> {
        let admitted = {
            let mut session = self.session.lock();
            if session.attempt.is_some() {
                tracing::debug!("Start ignored, another attempt is connecting");
                return Ok(CallOutcome::AlreadyConnecting);
            }
            let active = session
                .call
                .as_ref()
                .filter(|_| session.state == CallState::Active)
                .map(|c| (c.id, c.group_id == group_id, c.is_initiator(&self.local_user.id)));
            match active {
                Some((call_id, false, _)) => return Err(CallError::Busy(call_id)),
                Some((call_id, true, false)) => return Ok(CallOutcome::AlreadyActive(call_id)),
                Some((call_id, true, true)) => Err(call_id),
                None => {
                    session.reset_if_ended();
                    session.discard_pending();
                    session.transition(CallState::Connecting(CallDirection::Outgoing));
                    Ok(session.begin_attempt(None))
                }
            }
        };
        let (attempt, token) = match admitted {
            Ok(admitted) => admitted,
            Err(call_id) => {
                self.announce(&group_id, call_type).await;
                tracing::info!(call_id = %call_id, "Call already running, re-announced");
                return Ok(CallOutcome::Reused(call_id));
            }
        };
        self.publish();

        let result = self.run_start(&token, group_id, call_type).await;
        self.finish_attempt(attempt, result).await
    }

    async fn run_start(
        &self,
        token: &CancellationToken,
        group_id: GroupId,
        call_type: CallType,
    ) -> Result<CallOutcome, FlowError> {
        let existing = match guarded(token, self.directory.active_call(&group_id)).await? {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(error = %e, "Active call lookup failed, starting a new call");
                None
            }
        };

        match existing {
            Some(info) if info.initiator_id == self.local_user.id => {
                self.resume_own_call(token, info).await
            }
            Some(info) => {
                tracing::info!(call_id = %info.call_id, "Group already has a call, joining it");
                {
                    let mut session = self.session.lock();
                    session.transition(CallState::Connecting(CallDirection::Incoming));
                    if let Some(attempt) = session.attempt.as_mut() {
                        attempt.call_id = Some(info.call_id);
                    }
                }
                self.publish();
                let call_id = info.call_id;
                self.run_join(token, call_id, Some(info)).await
            }
            None => self.create_call(token, group_id, call_type).await,
        }
    }

    async fn create_call(
        &self,
        token: &CancellationToken,
        group_id: GroupId,
        call_type: CallType,
    ) -> Result<CallOutcome, FlowError> {
        let registered = guarded(
            token,
            self.directory
                .create_call(&group_id, call_type, &self.local_user),
        )
        .await?;
        let call_id = match registered {
            Ok(info) => info.call_id,
            Err(e) => {
                tracing::warn!(error = %e, "Call registration failed, using a local call id");
                CallId::new()
            }
        };

        {
            let mut session = self.session.lock();
            let call = Call::new(
                call_id,
                group_id.clone(),
                call_type,
                self.local_user.id.clone(),
                session.state,
            );
            session.call = Some(call);
            if let Some(attempt) = session.attempt.as_mut() {
                attempt.call_id = Some(call_id);
            }
        }

        self.prepare_media(token, call_type.wants_video()).await?;
        self.activate(Vec::new());
        guarded(token, self.announce(&group_id, call_type)).await?;

        tracing::info!(call_id = %call_id, "Call started");
        Ok(CallOutcome::Started(call_id))
    }

    /// Our own call is still registered (e.g. after a restart): take it over
    async fn resume_own_call(
        &self,
        token: &CancellationToken,
        info: ActiveCallInfo,
    ) -> Result<CallOutcome, FlowError> {
        let call_id = info.call_id;
        tracing::info!(call_id = %call_id, "Reusing own active call");
        let (group_id, call_type) = (info.group_id.clone(), info.call_type);
        {
            let mut session = self.session.lock();
            let state = session.state;
            session.call = Some(info.into_call(state));
            if let Some(attempt) = session.attempt.as_mut() {
                attempt.call_id = Some(call_id);
            }
        }

        self.prepare_media(token, call_type.wants_video()).await?;
        let remotes = self.activate(Vec::new());
        guarded(token, self.announce(&group_id, call_type)).await?;
        self.connect_to(token, call_id, remotes).await?;
        Ok(CallOutcome::Reused(call_id))
    }

    async fn announce(&self, group_id: &GroupId, call_type: CallType) {
        if let Err(e) = self.signaling.start_group_call(group_id, call_type).await {
            tracing::warn!(error = %e, "Call announcement failed");
        }
    }

    /// Join `call_id`
    ///
    /// No-op while already active in that call or while another start or
    /// join is connecting.
    ///
    /// # Errors
    ///
    /// [`CallError::Media`] when no audio can be captured,
    /// [`CallError::Busy`] when active in another call,
    /// [`CallError::UnknownCall`] when nothing is known about the call,
    /// [`CallError::JoinTimedOut`] when the directory does not answer within
    /// `join_timeout`.
    #[tracing::instrument(skip_all, fields(call_id = %call_id))]
    pub async fn join_call(&self, call_id: CallId) -> Result<CallOutcome, CallError> {
        let (attempt, token) = {
            let mut session = self.session.lock();
            if let (CallState::Active, Some(call)) = (session.state, session.call.as_ref()) {
                if call.id == call_id {
                    return Ok(CallOutcome::AlreadyActive(call_id));
                }
                return Err(CallError::Busy(call.id));
            }
            if session.attempt.is_some() {
                tracing::debug!("Join ignored, another attempt is connecting");
                return Ok(CallOutcome::AlreadyConnecting);
            }
            session.reset_if_ended();
            if session.call.as_ref().is_some_and(|c| c.id != call_id) {
                session.discard_pending();
            }
            session.transition(CallState::Connecting(CallDirection::Incoming));
            session.begin_attempt(Some(call_id))
        };
        self.publish();

        let result = self.run_join(&token, call_id, None).await;
        self.finish_attempt(attempt, result).await
    }

    async fn run_join(
        &self,
        token: &CancellationToken,
        call_id: CallId,
        known: Option<ActiveCallInfo>,
    ) -> Result<CallOutcome, FlowError> {
        let timeout_ms = self.config.join_timeout.as_millis() as u64;
        let registration = tokio::time::timeout(
            self.config.join_timeout,
            self.directory.join_call(call_id, &self.local_user),
        );
        let info = match guarded(token, registration).await? {
            Ok(Ok(info)) => Some(info),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Directory join failed");
                known
            }
            Err(_) => {
                tracing::warn!(timeout_ms, "Directory join timed out");
                return Err(CallError::JoinTimedOut(call_id).into());
            }
        };

        // Settle the call type before capturing
        let call_type = info.as_ref().map(|i| i.call_type).or_else(|| {
            let session = self.session.lock();
            session
                .call
                .as_ref()
                .filter(|c| c.id == call_id)
                .map(|c| c.call_type)
        });
        let Some(call_type) = call_type else {
            return Err(CallError::UnknownCall(call_id).into());
        };
        self.prepare_media(token, call_type.wants_video()).await?;

        // Members only learn about us once our tracks are in place
        let announcement = tokio::time::timeout(
            self.config.join_timeout,
            self.signaling.join_group_call(call_id),
        );
        match guarded(token, announcement).await? {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "JoinGroupCall failed"),
            Err(_) => tracing::warn!(timeout_ms, "JoinGroupCall timed out"),
        }

        // Offers that raced the handshake already created connections
        let connected = self.peers.participants().await;

        if token.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        {
            let mut session = self.session.lock();
            let pending = session.call.take().filter(|c| c.id == call_id);
            let state = session.state;
            let mut call = match (info, pending) {
                (Some(info), pending) => {
                    let mut call = info.into_call(state);
                    for participant in pending.into_iter().flat_map(|p| p.participants.into_values())
                    {
                        if !call.participants.contains_key(&participant.user_id) {
                            call.add_participant(participant);
                        }
                    }
                    call
                }
                (None, Some(pending)) => pending,
                (None, None) => return Err(CallError::UnknownCall(call_id).into()),
            };
            for user in &connected {
                if !call.participants.contains_key(user) {
                    call.add_participant(Participant::new(user.clone(), user.to_string()));
                }
            }
            session.call = Some(call);
        }

        let remotes = self.activate(connected);
        tracing::info!(call_id = %call_id, participants = remotes.len(), "Joined call");
        self.connect_to(token, call_id, remotes).await?;
        Ok(CallOutcome::Joined(call_id))
    }

    /// Capture local media and configure connections for this attempt
    async fn prepare_media(
        &self,
        token: &CancellationToken,
        wants_video: bool,
    ) -> Result<(), FlowError> {
        let acquired = guarded(token, self.media.acquire(wants_video))
            .await?
            .map_err(CallError::Media)?;

        let ice_servers = match guarded(token, self.directory.ice_servers()).await? {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => self.config.default_ice_servers.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "ICE server fetch failed, using defaults");
                self.config.default_ice_servers.clone()
            }
        };
        self.peers.set_ice_servers(ice_servers);
        self.peers.set_local_tracks(acquired.stream.tracks());

        self.session.lock().camera_unavailable = acquired.camera_unavailable;
        Ok(())
    }

    /// Enter `Active`, adding the local participant
    ///
    /// Returns the remote participants that still need an offer, i.e. every
    /// remote participant except those in `connected`.
    fn activate(&self, connected: Vec<UserId>) -> Vec<UserId> {
        let local = self.local_participant();
        let (remotes, announced) = {
            let mut session = self.session.lock();
            session.transition(CallState::Active);
            match session.call.as_mut() {
                Some(call) => {
                    call.add_participant(local);
                    let remote: Vec<_> = call
                        .remote_participants(&self.local_user.id)
                        .cloned()
                        .collect();
                    (
                        remote
                            .iter()
                            .map(|p| p.user_id.clone())
                            .filter(|id| !connected.contains(id))
                            .collect(),
                        remote.into_iter().map(|p| (call.id, p)).collect::<Vec<_>>(),
                    )
                }
                None => (Vec::new(), Vec::new()),
            }
        };
        self.publish();
        for (call_id, participant) in announced {
            self.emit(CallEvent::ParticipantJoined {
                call_id,
                participant,
            });
        }
        remotes
    }

    /// Offer to every participant in `remotes`; failures evict
    async fn connect_to(
        &self,
        token: &CancellationToken,
        call_id: CallId,
        remotes: Vec<UserId>,
    ) -> Result<(), FlowError> {
        let offers = join_all(remotes.iter().map(|p| self.offer_to(call_id, p)));
        let results = guarded(token, offers).await?;
        for (participant, result) in remotes.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(participant = %participant, error = %e, "Offer failed, evicting");
                self.evict(participant).await;
            }
        }
        Ok(())
    }

    async fn offer_to(
        &self,
        call_id: CallId,
        participant: &UserId,
    ) -> Result<(), PeerError> {
        let offer = self.peers.create_offer(participant).await?;
        self.send_description(call_id, participant, offer).await;
        Ok(())
    }

    async fn send_description(
        &self,
        call_id: CallId,
        participant: &UserId,
        description: SessionDescription,
    ) {
        let is_offer = description.sdp_type == SdpType::Offer;
        let envelope = Envelope {
            call_id,
            from_user_id: self.local_user.id.clone(),
            target_user_id: participant.clone(),
            payload: description,
        };
        let sent = if is_offer {
            self.signaling.send_offer(&envelope).await
        } else {
            self.signaling.send_answer(&envelope).await
        };
        if let Err(e) = sent {
            tracing::warn!(participant = %participant, offer = is_offer, error = %e, "Sending description failed");
        }
    }

    async fn finish_attempt(
        &self,
        attempt: u64,
        result: Result<CallOutcome, FlowError>,
    ) -> Result<CallOutcome, CallError> {
        {
            let mut session = self.session.lock();
            if session.attempt.as_ref().is_some_and(|a| a.id == attempt) {
                session.attempt = None;
            }
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(FlowError::Cancelled) => {
                tracing::info!("Call attempt cancelled");
                // Anything acquired while the cancel raced us is released,
                // unless a newer attempt has taken over.
                let idle = {
                    let session = self.session.lock();
                    session.attempt.is_none() && session.state != CallState::Active
                };
                if idle {
                    self.release_resources().await;
                }
                Ok(CallOutcome::Cancelled)
            }
            Err(FlowError::Failed(e)) => {
                tracing::error!(error = %e, "Call attempt failed");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Leave the call, keeping it running for everyone else
    ///
    /// Local media and every connection are released even when the
    /// `LeaveGroupCall` invoke fails. Cancels a connecting start or join.
    ///
    /// # Errors
    ///
    /// [`CallError::NoActiveCall`] when there was nothing to leave.
    #[tracing::instrument(skip(self))]
    pub async fn leave_call(&self) -> Result<(), CallError> {
        let (call_id, joined, had_session) = {
            let mut session = self.session.lock();
            let cancelled = session.cancel_attempt();
            let call_id = session.live_call().map(|c| c.id);
            let joined = cancelled || session.state == CallState::Active;
            let had_session = cancelled || !matches!(session.state, CallState::Idle | CallState::Ended);
            (call_id, joined, had_session)
        };

        self.release_resources().await;
        if let (true, Some(call_id)) = (joined, call_id) {
            if let Err(e) = self.signaling.leave_group_call(call_id).await {
                tracing::warn!(call_id = %call_id, error = %e, "LeaveGroupCall failed");
            }
        }

        self.enter_ended();

        if had_session {
            tracing::info!(call_id = ?call_id, "Left call");
            Ok(())
        } else {
            Err(CallError::NoActiveCall)
        }
    }

    /// End the call for everyone; initiator only
    ///
    /// # Errors
    ///
    /// [`CallError::NoActiveCall`] without a call,
    /// [`CallError::NotInitiator`] when someone else started it.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let call_id = {
            let mut session = self.session.lock();
            let (call_id, initiator) = match session.live_call() {
                Some(call) => (call.id, call.is_initiator(&self.local_user.id)),
                None => return Err(CallError::NoActiveCall),
            };
            if !initiator {
                return Err(CallError::NotInitiator);
            }
            session.cancel_attempt();
            call_id
        };

        let ended = self.signaling.end_group_call(call_id).await;
        self.teardown().await;

        if let Err(e) = ended {
            tracing::warn!(call_id = %call_id, error = %e, "EndGroupCall failed");
        }
        tracing::info!(call_id = %call_id, "Call ended");
        Ok(())
    }

    /// Flip the local `kind` tracks and announce the new state
    ///
    /// # Errors
    ///
    /// [`CallError::NoActiveCall`] without a call, [`CallError::Media`] when
    /// there is no such track.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_media(&self, kind: MediaKind) -> Result<bool, CallError> {
        let call_id = self
            .session
            .lock()
            .live_call()
            .map(|c| c.id)
            .ok_or(CallError::NoActiveCall)?;
        let enabled = self
            .media
            .toggle(kind)
            .ok_or(CallError::Media(MediaError::NoTrack(kind)))?;

        self.set_media_flag(call_id, self.local_user.id.clone(), kind, enabled);
        if let Err(e) = self.signaling.toggle_media(call_id, kind, enabled).await {
            tracing::warn!(error = %e, "ToggleGroupCallMedia failed");
        }
        Ok(enabled)
    }

    /// Record a participant's media flag; observers hear about known
    /// participants only
    fn set_media_flag(&self, call_id: CallId, user_id: UserId, kind: MediaKind, enabled: bool) {
        let updated = {
            let mut session = self.session.lock();
            match session
                .live_call_mut(call_id)
                .and_then(|c| c.participants.get_mut(&user_id))
            {
                Some(participant) => {
                    match kind {
                        MediaKind::Audio => participant.is_audio_enabled = enabled,
                        MediaKind::Video => participant.is_video_enabled = enabled,
                    }
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(CallEvent::MediaToggled {
                call_id,
                user_id,
                kind,
                enabled,
            });
            self.publish();
        }
    }

    /// Add a camera track to an audio-only session and renegotiate
    ///
    /// # Errors
    ///
    /// [`CallError::NoActiveCall`] when not active, [`CallError::Media`] when
    /// the camera cannot be opened or no connection accepted the track.
    #[tracing::instrument(skip(self))]
    pub async fn enable_video(&self) -> Result<(), CallError> {
        let call_id = self
            .session
            .lock()
            .active_call_id()
            .ok_or(CallError::NoActiveCall)?;

        let offers = self
            .media
            .add_track_late(MediaKind::Video, &self.peers)
            .await?;
        join_all(
            offers
                .into_iter()
                .map(|(participant, offer)| async move {
                    self.send_description(call_id, &participant, offer).await;
                }),
        )
        .await;

        self.session.lock().camera_unavailable = false;
        self.set_media_flag(call_id, self.local_user.id.clone(), MediaKind::Video, true);
        if let Err(e) = self
            .signaling
            .toggle_media(call_id, MediaKind::Video, true)
            .await
        {
            tracing::warn!(error = %e, "ToggleGroupCallMedia failed");
        }
        Ok(())
    }

    /// Dismiss a pending incoming call without joining
    ///
    /// Nothing is sent. Returns `false` when there was no pending call.
    pub fn decline_incoming(&self) -> bool {
        let declined = {
            let mut session = self.session.lock();
            let pending = session.call.as_ref().map(|c| c.id);
            session.discard_pending();
            pending.filter(|_| session.call.is_none())
        };
        match declined {
            Some(call_id) => {
                tracing::info!(call_id = %call_id, "Incoming call declined");
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Feed an event from the signaling gateway
    pub async fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Message { name, payload } => {
                match SignalingMessage::from_event(&name, payload) {
                    Ok(message) => self.handle_signal(message).await,
                    Err(e) => {
                        tracing::warn!(event = %name, error = %e, "Dropping undecodable event");
                    }
                }
            }
            GatewayEvent::Disconnected => {
                tracing::warn!("Signaling channel disconnected");
            }
            GatewayEvent::Reconnected => self.on_reconnected(),
        }
    }

    /// Handle a decoded inbound signaling message
    #[tracing::instrument(skip_all, fields(event = message.event_name(), call_id = %message.call_id()))]
    pub async fn handle_signal(&self, message: SignalingMessage) {
        if message.target().is_some_and(|t| t != &self.local_user.id) {
            tracing::trace!("Not addressed to us");
            return;
        }
        match message {
            SignalingMessage::CallStarted(announcement) => self.on_call_started(announcement),
            SignalingMessage::CallEnded(notice) => self.on_call_ended(notice).await,
            SignalingMessage::ParticipantJoined(notice) => self.on_participant_joined(notice).await,
            SignalingMessage::ParticipantLeft(notice) => self.on_participant_left(notice).await,
            SignalingMessage::MediaToggled(notice) => self.on_media_toggled(notice),
            SignalingMessage::Offer(envelope) => self.on_offer(envelope).await,
            SignalingMessage::Answer(envelope) => self.on_answer(envelope).await,
            SignalingMessage::IceCandidate(envelope) => self.on_remote_candidate(envelope).await,
        }
    }

    fn on_call_started(&self, announcement: CallAnnouncement) {
        if announcement.initiator_id == self.local_user.id {
            tracing::trace!("Own announcement echoed");
            return;
        }
        let created = {
            let mut session = self.session.lock();
            if session.live_call().is_some_and(|c| c.id == announcement.call_id) {
                false
            } else if session.attempt.is_some()
                || matches!(session.state, CallState::Active | CallState::Connecting(_))
            {
                tracing::debug!("Busy, not surfacing incoming call");
                false
            } else {
                session.reset_if_ended();
                session.transition(CallState::Connecting(CallDirection::Incoming));
                let call = Call::new(
                    announcement.call_id,
                    announcement.group_id.clone(),
                    announcement.call_type,
                    announcement.initiator_id.clone(),
                    session.state,
                );
                session.call = Some(call);
                true
            }
        };
        if created {
            tracing::info!(initiator = %announcement.initiator_id, "Incoming call");
            self.emit(CallEvent::IncomingCall {
                call_id: announcement.call_id,
                group_id: announcement.group_id,
                initiator_id: announcement.initiator_id,
                call_type: announcement.call_type,
            });
            self.publish();
        }
    }

    async fn on_call_ended(&self, notice: CallEndedNotice) {
        let matched = {
            let mut session = self.session.lock();
            if session.live_call().is_some_and(|c| c.id == notice.call_id) {
                session.cancel_attempt();
                true
            } else {
                false
            }
        };
        if !matched {
            return;
        }
        tracing::info!(ended_by = ?notice.ended_by, "Call ended remotely");
        self.teardown().await;
    }

    async fn on_participant_joined(&self, notice: ParticipantJoinedNotice) {
        let user = notice.participant.user_id.clone();
        if user == self.local_user.id {
            return;
        }
        let added = {
            let mut session = self.session.lock();
            let active = session.state == CallState::Active;
            session.live_call_mut(notice.call_id).map(|call| {
                let participant = notice.participant.into_participant();
                call.add_participant(participant.clone());
                (participant, active)
            })
        };
        let Some((participant, active)) = added else {
            return;
        };

        if active {
            if let Err(e) = self.peers.ensure_entry(&user).await {
                tracing::warn!(participant = %user, error = %e, "Connection setup failed, evicting");
                self.evict(&user).await;
                return;
            }
        }
        tracing::info!(participant = %user, "Participant joined");
        self.emit(CallEvent::ParticipantJoined {
            call_id: notice.call_id,
            participant,
        });
        self.publish();
    }

    async fn on_participant_left(&self, notice: ParticipantLeftNotice) {
        if notice.user_id == self.local_user.id {
            return;
        }
        if self.session.lock().live_call().map(|c| c.id) != Some(notice.call_id) {
            return;
        }
        self.remove_participant(Some(notice.call_id), &notice.user_id, false)
            .await;
    }

    fn on_media_toggled(&self, notice: MediaToggleNotice) {
        if notice.user_id == self.local_user.id {
            return;
        }
        self.set_media_flag(notice.call_id, notice.user_id, notice.kind, notice.enabled);
    }

    async fn on_offer(&self, envelope: Envelope<SessionDescription>) {
        let from = envelope.from_user_id.clone();
        let placeholder = {
            let mut session = self.session.lock();
            if !session.accepts_negotiation(envelope.call_id) {
                tracing::debug!(from = %from, "Ignoring offer outside an accepted call");
                return;
            }
            match session.live_call_mut(envelope.call_id) {
                Some(call) if !call.participants.contains_key(&from) => {
                    let participant = Participant::new(from.clone(), from.to_string());
                    call.add_participant(participant.clone());
                    Some(participant)
                }
                _ => None,
            }
        };
        if let Some(participant) = placeholder {
            tracing::debug!(participant = %from, "Offer from unknown sender, added placeholder");
            self.emit(CallEvent::ParticipantJoined {
                call_id: envelope.call_id,
                participant,
            });
            self.publish();
        }

        match self.peers.handle_offer(&from, envelope.payload).await {
            Ok(Some(answer)) => self.outbox.push(Outbound::Description(Envelope {
                call_id: envelope.call_id,
                from_user_id: self.local_user.id.clone(),
                target_user_id: from.clone(),
                payload: answer,
            })),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(participant = %from, error = %e, "Offer rejected, evicting");
                self.evict(&from).await;
            }
        }
    }

    async fn on_answer(&self, envelope: Envelope<SessionDescription>) {
        if !self.session.lock().accepts_negotiation(envelope.call_id) {
            return;
        }
        let from = envelope.from_user_id;
        match self.peers.handle_answer(&from, envelope.payload).await {
            Ok(()) => {}
            Err(e) if e.is_protocol_violation() => {
                tracing::warn!(participant = %from, error = %e, "Protocol violation, answer ignored");
            }
            Err(e) => {
                tracing::warn!(participant = %from, error = %e, "Answer rejected, evicting");
                self.evict(&from).await;
            }
        }
    }

    async fn on_remote_candidate(&self, envelope: Envelope<IceCandidate>) {
        if !self.session.lock().accepts_negotiation(envelope.call_id) {
            return;
        }
        let from = envelope.from_user_id;
        match self.peers.handle_ice_candidate(&from, envelope.payload).await {
            Ok(outcome) => tracing::trace!(participant = %from, ?outcome, "Remote candidate"),
            Err(e) => tracing::warn!(participant = %from, error = %e, "Remote candidate rejected"),
        }
    }

    /// Feed an event reported by a peer connection
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                participant,
                candidate,
            } => {
                let Some(call_id) = self.session.lock().negotiating_call() else {
                    return;
                };
                self.outbox.push(Outbound::Candidate(Envelope {
                    call_id,
                    from_user_id: self.local_user.id.clone(),
                    target_user_id: participant,
                    payload: candidate,
                }));
            }
            other => match self.peers.apply_event(&other).await {
                Some(PeerUpdate::StateChanged(state)) => {
                    self.on_link_state(other.participant(), state);
                }
                Some(PeerUpdate::TrackAdded(track)) => {
                    tracing::debug!(participant = %other.participant(), kind = %track.kind, "Remote track");
                    self.emit(CallEvent::RemoteStreamAdded {
                        participant: other.participant().clone(),
                        track,
                    });
                }
                None => {}
            },
        }
    }

    fn on_link_state(&self, participant: &UserId, state: PeerConnectionState) {
        let quality = state.quality();
        let changed = {
            let mut session = self.session.lock();
            let Some(call_id) = session.live_call().map(|c| c.id) else {
                return;
            };
            match session
                .live_call_mut(call_id)
                .and_then(|c| c.participants.get_mut(participant))
            {
                Some(p) if p.connection_quality != quality => {
                    p.connection_quality = quality;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(CallEvent::QualityChanged {
                user_id: participant.clone(),
                quality,
            });
            self.publish();
        }

        match quality {
            ConnectionQuality::Broken if state != PeerConnectionState::Closed => {
                self.schedule_eviction(participant);
            }
            ConnectionQuality::Good => {
                if self.session.lock().evictions.remove(participant).is_some() {
                    tracing::debug!(participant = %participant, "Link recovered, eviction cancelled");
                }
            }
            _ => {}
        }
    }

    fn schedule_eviction(&self, participant: &UserId) {
        let generation = {
            let mut session = self.session.lock();
            if session.evictions.contains_key(participant) {
                return;
            }
            session.eviction_seq += 1;
            let generation = session.eviction_seq;
            session.evictions.insert(participant.clone(), generation);
            generation
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let grace = self.config.eviction_grace;
        let participant = participant.clone();
        tracing::debug!(participant = %participant, grace_ms = grace.as_millis() as u64, "Link broken, eviction scheduled");

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let due = this.session.lock().evictions.get(&participant) == Some(&generation);
            if !due {
                return;
            }
            let broken = this
                .peers
                .connection_state(&participant)
                .await
                .is_some_and(|s| s.quality() == ConnectionQuality::Broken);
            if broken {
                this.evict(&participant).await;
            } else {
                this.session.lock().evictions.remove(&participant);
            }
        });
    }

    /// Remove a participant whose connection failed
    async fn evict(&self, participant: &UserId) {
        let call_id = self.session.lock().live_call().map(|c| c.id);
        self.remove_participant(call_id, participant, true).await;
    }

    /// Drop `participant` from `call_id`, closing its connection and queue
    async fn remove_participant(&self, call_id: Option<CallId>, participant: &UserId, evicted: bool) {
        let removed = {
            let mut session = self.session.lock();
            session.evictions.remove(participant);
            call_id.filter(|id| {
                session
                    .live_call_mut(*id)
                    .and_then(|c| c.remove_participant(participant))
                    .is_some()
            })
        };

        self.outbox.close(participant);
        if self.peers.remove_participant(participant).await {
            self.emit(CallEvent::RemoteStreamRemoved {
                participant: participant.clone(),
            });
        }
        if let Some(call_id) = removed {
            if evicted {
                tracing::warn!(participant = %participant, "Participant evicted");
            } else {
                tracing::info!(participant = %participant, "Participant left");
            }
            self.emit(CallEvent::ParticipantLeft {
                call_id,
                user_id: participant.clone(),
                evicted,
            });
            self.publish();
        }
    }

    fn on_reconnected(&self) {
        let Some(call_id) = self.session.lock().active_call_id() else {
            tracing::debug!("Signaling reconnected, no active call");
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.rejoin(call_id).await });
    }

    /// Re-register membership after a signaling reconnect
    #[tracing::instrument(skip_all, fields(call_id = %call_id))]
    async fn rejoin(&self, call_id: CallId) {
        tracing::info!("Signaling reconnected, re-registering membership");
        let result = self
            .config
            .rejoin_retry
            .run(|_| self.signaling.join_group_call(call_id))
            .await;

        if self.session.lock().active_call_id() != Some(call_id) {
            return;
        }
        self.session.lock().degraded = result.is_err();
        match result {
            Ok(()) => tracing::info!("Membership re-registered"),
            Err(e) => {
                tracing::warn!(attempts = e.attempts, error = %e.last, "Rejoin failed, continuing degraded");
                self.emit(CallEvent::Degraded { call_id });
            }
        }
        self.publish();
    }

    fn enter_ended(&self) {
        self.session.lock().transition(CallState::Ended);
        self.publish();
    }

    /// Release everything, then end the session
    async fn teardown(&self) {
        self.release_resources().await;
        self.enter_ended();
    }

    /// Close every connection and stop local media
    async fn release_resources(&self) {
        for participant in self.peers.close_all().await {
            self.emit(CallEvent::RemoteStreamRemoved { participant });
        }
        self.outbox.clear();
        let stopped = self.media.release();
        self.session.lock().evictions.clear();
        tracing::debug!(stopped, "Call resources released");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::DirectoryError;
    use crate::media::{CaptureConstraints, LocalTrack, MediaDevices};
    use crate::peer::{PeerError, PeerEventSink, PeerFactory, RtcPeer};
    use crate::signaling::{GatewayState, SignalingError, SignalingGateway};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct NullGateway {
        invoked: Mutex<Vec<String>>,
        events: broadcast::Sender<GatewayEvent>,
    }

    #[async_trait]
    impl SignalingGateway for NullGateway {
        async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<(), SignalingError> {
            self.invoked.lock().push(method.to_string());
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
            self.events.subscribe()
        }
        fn connection_state(&self) -> GatewayState {
            GatewayState::Connected
        }
    }

    struct EmptyDirectory;

    #[async_trait]
    impl CallDirectory for EmptyDirectory {
        async fn active_call(
            &self,
            _group_id: &GroupId,
        ) -> Result<Option<ActiveCallInfo>, DirectoryError> {
            Ok(None)
        }
        async fn create_call(
            &self,
            _group_id: &GroupId,
            _call_type: CallType,
            _initiator: &LocalUser,
        ) -> Result<ActiveCallInfo, DirectoryError> {
            Err(DirectoryError::RequestFailed("offline".into()))
        }
        async fn join_call(
            &self,
            call_id: CallId,
            _user: &LocalUser,
        ) -> Result<ActiveCallInfo, DirectoryError> {
            Err(DirectoryError::CallNotFound(call_id.to_string()))
        }
        async fn ice_servers(&self) -> Result<Vec<IceServer>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    struct MicOnly;

    #[async_trait]
    impl MediaDevices for MicOnly {
        async fn get_user_media(
            &self,
            constraints: &CaptureConstraints,
        ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
            if constraints.video.is_some() {
                return Err(MediaError::DeviceNotFound("camera".into()));
            }
            Ok(vec![Arc::new(LocalTrack::new(MediaKind::Audio, "mic"))])
        }
    }

    struct NoPeers;

    #[async_trait]
    impl PeerFactory for NoPeers {
        async fn create_peer(
            &self,
            _participant: &UserId,
            _ice_servers: &[IceServer],
            _events: PeerEventSink,
        ) -> Result<Arc<dyn RtcPeer>, PeerError> {
            Err(PeerError::Setup("no peers in this test".into()))
        }
    }

    fn orchestrator() -> (Arc<CallOrchestrator>, Arc<NullGateway>) {
        let (events, _) = broadcast::channel(16);
        let gateway = Arc::new(NullGateway {
            invoked: Mutex::new(Vec::new()),
            events,
        });
        let config = CallConfig::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let local = LocalUser::new("alice", "Alice");
        let context = CallContext {
            signaling: SignalingClient::new(
                gateway.clone(),
                config.invoke_timeout,
                config.invoke_retry.clone(),
            ),
            directory: Arc::new(EmptyDirectory),
            media: Arc::new(MediaController::new(Arc::new(MicOnly))),
            peers: Arc::new(PeerConnectionManager::new(
                local.id.clone(),
                Arc::new(NoPeers),
                tx,
            )),
            local_user: local,
        };
        (CallOrchestrator::new(context, config, 64), gateway)
    }

    #[test]
    fn test_config_durations_are_milliseconds() {
        let json = serde_json::to_value(CallConfig::default()).unwrap();
        assert_eq!(json["join_timeout"], 5000);
        assert_eq!(json["eviction_grace"], 15000);

        let parsed: CallConfig = serde_json::from_str(r#"{"join_timeout": 250}"#).unwrap();
        assert_eq!(parsed.join_timeout, Duration::from_millis(250));
        assert_eq!(parsed.invoke_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_falls_back_to_local_call_id_and_audio() {
        let (calls, gateway) = orchestrator();
        let outcome = calls
            .start_call(GroupId::new("g1"), CallType::Video)
            .await
            .unwrap();

        let snapshot = calls.snapshot();
        assert_eq!(snapshot.state, CallState::Active);
        assert!(snapshot.camera_unavailable);
        assert_eq!(snapshot.call.unwrap().id, outcome.call_id().unwrap());
        assert_eq!(gateway.invoked.lock().clone(), vec!["StartGroupCall"]);
    }

    #[tokio::test]
    async fn test_state_observers_see_latest_snapshot() {
        let (calls, _) = orchestrator();
        let mut snapshots = calls.on_state_change();
        assert_eq!(snapshots.borrow().state, CallState::Idle);

        calls
            .start_call(GroupId::new("g1"), CallType::Audio)
            .await
            .unwrap();
        assert!(snapshots.has_changed().unwrap());
        let latest = snapshots.borrow_and_update().clone();
        assert_eq!(latest.state, CallState::Active);
        assert_eq!(latest.call.map(|c| c.participants.len()), Some(1));
    }

    #[tokio::test]
    async fn test_toggle_without_call_is_error() {
        let (calls, _) = orchestrator();
        assert_eq!(
            calls.toggle_media(MediaKind::Audio).await,
            Err(CallError::NoActiveCall)
        );
    }

    #[tokio::test]
    async fn test_leave_without_call_reports_no_active_call() {
        let (calls, _) = orchestrator();
        assert_eq!(calls.leave_call().await, Err(CallError::NoActiveCall));
        assert_eq!(calls.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_join_unknown_call_fails_before_capture_or_announce() {
        let (calls, gateway) = orchestrator();
        let err = calls.join_call(CallId::new()).await.unwrap_err();
        assert!(matches!(err, CallError::UnknownCall(_)));
        assert_eq!(calls.state(), CallState::Ended);
        assert!(calls.media().stream().is_none());
        assert!(gateway.invoked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_call_then_decline() {
        let (calls, _) = orchestrator();
        let mut events = calls.subscribe();
        calls
            .handle_signal(SignalingMessage::CallStarted(CallAnnouncement {
                call_id: CallId::new(),
                group_id: GroupId::new("g1"),
                call_type: CallType::Audio,
                initiator_id: UserId::new("bob"),
            }))
            .await;

        assert_eq!(
            calls.state(),
            CallState::Connecting(CallDirection::Incoming)
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::IncomingCall { .. }
        ));
        assert!(calls.decline_incoming());
        assert_eq!(calls.state(), CallState::Idle);
        assert!(!calls.decline_incoming());
    }
}

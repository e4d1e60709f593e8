//! Mesh of peer connections
//!
//! One [`PeerConnectionEntry`] per remote participant. The actual connection
//! object comes from a [`PeerFactory`] (the `webrtc` crate by default, a fake
//! in tests), so everything in this module is about ordering and lifecycle:
//!
//! - entries are created lazily (or eagerly on a join notice) and at most
//!   once per participant
//! - offer/answer/candidate handling for one participant is serialized on
//!   that entry's negotiation lock; different participants run concurrently
//! - candidates go through the [`IceCandidateBuffer`] until the first remote
//!   description is applied

use crate::ice::{Disposition, IceCandidateBuffer};
use crate::identity::UserId;
use crate::media::LocalTrack;
use crate::types::{
    IceCandidate, IceServer, PeerConnectionState, RemoteStream, RemoteTrackInfo,
    SessionDescription,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// No entry for the participant
    #[error("No connection to {0}")]
    NoConnection(UserId),

    /// Answer arrived without an outstanding local offer
    #[error("Unexpected answer from {0}")]
    UnexpectedAnswer(UserId),

    /// The media engine rejected an operation
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Connection could not be created
    #[error("Connection setup failed: {0}")]
    Setup(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,
}

impl PeerError {
    /// Whether the error comes from the remote side breaking the protocol
    /// rather than from our connection
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::NoConnection(_) | Self::UnexpectedAnswer(_))
    }
}

/// Something a connection reports asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Native connection state changed
    StateChanged {
        /// Remote participant
        participant: UserId,
        /// New state
        state: PeerConnectionState,
    },
    /// A local ICE candidate was gathered and must be sent out
    LocalCandidate {
        /// Remote participant
        participant: UserId,
        /// The candidate
        candidate: IceCandidate,
    },
    /// A remote track arrived
    RemoteTrack {
        /// Remote participant
        participant: UserId,
        /// Track description
        track: RemoteTrackInfo,
    },
}

impl PeerEvent {
    /// Participant the event is about
    #[must_use]
    pub fn participant(&self) -> &UserId {
        match self {
            Self::StateChanged { participant, .. }
            | Self::LocalCandidate { participant, .. }
            | Self::RemoteTrack { participant, .. } => participant,
        }
    }
}

/// Handle a connection uses to report events for its participant
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    participant: UserId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    /// Create a sink for `participant`
    #[must_use]
    pub fn new(participant: UserId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { participant, tx }
    }

    /// Participant this sink reports for
    #[must_use]
    pub fn participant(&self) -> &UserId {
        &self.participant
    }

    /// Report a state change
    pub fn state_changed(&self, state: PeerConnectionState) {
        self.send(PeerEvent::StateChanged {
            participant: self.participant.clone(),
            state,
        });
    }

    /// Report a gathered local candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.send(PeerEvent::LocalCandidate {
            participant: self.participant.clone(),
            candidate,
        });
    }

    /// Report a remote track
    pub fn remote_track(&self, track: RemoteTrackInfo) {
        self.send(PeerEvent::RemoteTrack {
            participant: self.participant.clone(),
            track,
        });
    }

    fn send(&self, event: PeerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(participant = %self.participant, "Peer event dropped, engine gone");
        }
    }
}

/// One peer connection as seen by the engine
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Detach a previously attached local track
    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Drop an outstanding local offer
    async fn rollback_local_description(&self) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a connection to `participant`
    ///
    /// The connection reports state changes, gathered candidates and remote
    /// tracks through `events`.
    async fn create_peer(
        &self,
        participant: &UserId,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError>;
}

/// Offer/answer position of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer outstanding
    Stable,
    /// We sent an offer and wait for the answer
    HaveLocalOffer,
}

/// Connection to one remote participant
///
/// The participant's early ICE candidates live in the manager's
/// [`IceCandidateBuffer`] under the same key.
pub struct PeerConnectionEntry {
    participant_id: UserId,
    connection: Arc<dyn RtcPeer>,
    connection_state: Mutex<PeerConnectionState>,
    negotiation: tokio::sync::Mutex<NegotiationState>,
}

impl PeerConnectionEntry {
    /// Remote participant
    #[must_use]
    pub fn participant_id(&self) -> &UserId {
        &self.participant_id
    }

    /// Last reported connection state
    #[must_use]
    pub fn connection_state(&self) -> PeerConnectionState {
        *self.connection_state.lock()
    }
}

/// Outcome of [`PeerConnectionManager::handle_ice_candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Queued until the remote description is set
    Buffered,
    /// Handed to the connection
    Applied,
}

/// What [`PeerConnectionManager::apply_event`] changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    /// Connection state differs from the last report
    StateChanged(PeerConnectionState),
    /// A track was added to the participant's remote stream
    TrackAdded(RemoteTrackInfo),
}

/// Owner of every peer connection in the mesh
pub struct PeerConnectionManager {
    local_user: UserId,
    factory: Arc<dyn PeerFactory>,
    ice_servers: RwLock<Vec<IceServer>>,
    local_tracks: RwLock<Vec<Arc<LocalTrack>>>,
    entries: tokio::sync::Mutex<HashMap<UserId, Arc<PeerConnectionEntry>>>,
    buffer: Mutex<IceCandidateBuffer>,
    remote_streams: RwLock<HashMap<UserId, RemoteStream>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnectionManager {
    /// Create a manager; connections report through `events`
    #[must_use]
    pub fn new(
        local_user: UserId,
        factory: Arc<dyn PeerFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_user,
            factory,
            ice_servers: RwLock::new(Vec::new()),
            local_tracks: RwLock::new(Vec::new()),
            entries: tokio::sync::Mutex::new(HashMap::new()),
            buffer: Mutex::new(IceCandidateBuffer::new()),
            remote_streams: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// ICE servers for connections created from now on
    pub fn set_ice_servers(&self, servers: Vec<IceServer>) {
        *self.ice_servers.write() = servers;
    }

    /// Local tracks wired into connections created from now on
    pub fn set_local_tracks(&self, tracks: Vec<Arc<LocalTrack>>) {
        *self.local_tracks.write() = tracks;
    }

    /// Forget a local track (after a failed late add)
    pub fn remove_local_track(&self, track_id: &str) {
        self.local_tracks.write().retain(|t| t.id() != track_id);
    }

    /// Number of entries
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Participants with an entry
    pub async fn participants(&self) -> Vec<UserId> {
        let mut participants: Vec<_> = self.entries.lock().await.keys().cloned().collect();
        participants.sort();
        participants
    }

    /// Last reported state of the link to `participant`
    pub async fn connection_state(&self, participant: &UserId) -> Option<PeerConnectionState> {
        let entries = self.entries.lock().await;
        entries.get(participant).map(|e| e.connection_state())
    }

    /// Candidates still waiting for `participant`'s remote description
    #[must_use]
    pub fn pending_candidates(&self, participant: &UserId) -> usize {
        self.buffer.lock().pending_len(participant)
    }

    /// Buffer counters for `participant`
    #[must_use]
    pub fn buffer_stats(&self, participant: &UserId) -> crate::ice::BufferStats {
        self.buffer.lock().stats(participant)
    }

    /// Remote streams keyed by participant
    #[must_use]
    pub fn remote_streams(&self) -> HashMap<UserId, RemoteStream> {
        self.remote_streams.read().clone()
    }

    async fn lookup(&self, participant: &UserId) -> Option<Arc<PeerConnectionEntry>> {
        self.entries.lock().await.get(participant).cloned()
    }

    /// Get the entry for `participant`, creating it on first use
    ///
    /// The map lock is held across creation so a participant never gets two
    /// connections.
    async fn entry(&self, participant: &UserId) -> Result<Arc<PeerConnectionEntry>, PeerError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(participant) {
            return Ok(entry.clone());
        }

        let ice_servers = self.ice_servers.read().clone();
        let sink = PeerEventSink::new(participant.clone(), self.events.clone());
        let connection = self
            .factory
            .create_peer(participant, &ice_servers, sink)
            .await?;

        let tracks = self.local_tracks.read().clone();
        for track in tracks {
            if let Err(e) = connection.add_track(track).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }

        let entry = Arc::new(PeerConnectionEntry {
            participant_id: participant.clone(),
            connection,
            connection_state: Mutex::new(PeerConnectionState::New),
            negotiation: tokio::sync::Mutex::new(NegotiationState::Stable),
        });
        entries.insert(participant.clone(), entry.clone());
        tracing::debug!(participant = %participant, entries = entries.len(), "Peer connection created");
        Ok(entry)
    }

    /// Create the entry for `participant` without negotiating
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created
    pub async fn ensure_entry(&self, participant: &UserId) -> Result<(), PeerError> {
        self.entry(participant).await.map(|_| ())
    }

    /// Create and apply an offer for `participant`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created or the engine
    /// rejects the offer.
    #[tracing::instrument(skip_all, fields(participant = %participant))]
    pub async fn create_offer(&self, participant: &UserId) -> Result<SessionDescription, PeerError> {
        let entry = self.entry(participant).await?;
        let mut negotiation = entry.negotiation.lock().await;
        let offer = entry.connection.create_offer().await?;
        entry.connection.set_local_description(offer.clone()).await?;
        *negotiation = NegotiationState::HaveLocalOffer;
        tracing::debug!("Local offer created");
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer
    ///
    /// On glare (we have an offer outstanding too) the participant with the
    /// smaller id keeps its offer: if that is us the remote offer is ignored
    /// and `None` is returned, otherwise our offer is rolled back first.
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the offer or cannot answer.
    #[tracing::instrument(skip_all, fields(participant = %participant))]
    pub async fn handle_offer(
        &self,
        participant: &UserId,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, PeerError> {
        let entry = self.entry(participant).await?;
        let mut negotiation = entry.negotiation.lock().await;

        if *negotiation == NegotiationState::HaveLocalOffer {
            if self.local_user.wins_glare_against(participant) {
                tracing::debug!("Offer collision, keeping local offer");
                return Ok(None);
            }
            tracing::debug!("Offer collision, rolling back local offer");
            entry.connection.rollback_local_description().await?;
            *negotiation = NegotiationState::Stable;
        }

        entry.connection.set_remote_description(offer).await?;
        self.flush_candidates(&entry).await;

        let answer = entry.connection.create_answer().await?;
        entry.connection.set_local_description(answer.clone()).await?;
        *negotiation = NegotiationState::Stable;
        tracing::debug!("Answer created");
        Ok(Some(answer))
    }

    /// Apply a remote answer to our outstanding offer
    ///
    /// # Errors
    ///
    /// [`PeerError::NoConnection`] without an entry,
    /// [`PeerError::UnexpectedAnswer`] without an outstanding offer, or the
    /// engine's error.
    #[tracing::instrument(skip_all, fields(participant = %participant))]
    pub async fn handle_answer(
        &self,
        participant: &UserId,
        answer: SessionDescription,
    ) -> Result<(), PeerError> {
        let entry = self
            .lookup(participant)
            .await
            .ok_or_else(|| PeerError::NoConnection(participant.clone()))?;
        let mut negotiation = entry.negotiation.lock().await;
        if *negotiation != NegotiationState::HaveLocalOffer {
            return Err(PeerError::UnexpectedAnswer(participant.clone()));
        }

        entry.connection.set_remote_description(answer).await?;
        *negotiation = NegotiationState::Stable;
        self.flush_candidates(&entry).await;
        tracing::debug!("Answer applied");
        Ok(())
    }

    /// Buffer or apply a remote candidate
    ///
    /// # Errors
    ///
    /// Returns the engine's error when an applied candidate is rejected.
    pub async fn handle_ice_candidate(
        &self,
        participant: &UserId,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, PeerError> {
        match self.lookup(participant).await {
            Some(entry) => {
                let _negotiation = entry.negotiation.lock().await;
                let disposition = self.buffer.lock().enqueue_or_apply(participant, candidate);
                self.dispose(&entry, disposition).await
            }
            None => {
                let disposition = self.buffer.lock().enqueue_or_apply(participant, candidate);
                match disposition {
                    Disposition::Buffered(_) => Ok(CandidateOutcome::Buffered),
                    // The entry appeared and flushed between the lookup and
                    // the enqueue; apply on it instead.
                    Disposition::Apply(candidate) => {
                        let entry = self
                            .lookup(participant)
                            .await
                            .ok_or_else(|| PeerError::NoConnection(participant.clone()))?;
                        let _negotiation = entry.negotiation.lock().await;
                        self.dispose(&entry, Disposition::Apply(candidate)).await
                    }
                }
            }
        }
    }

    async fn dispose(
        &self,
        entry: &PeerConnectionEntry,
        disposition: Disposition,
    ) -> Result<CandidateOutcome, PeerError> {
        match disposition {
            Disposition::Buffered(pending) => {
                tracing::trace!(participant = %entry.participant_id, pending, "Candidate buffered");
                Ok(CandidateOutcome::Buffered)
            }
            Disposition::Apply(candidate) => {
                entry.connection.add_ice_candidate(candidate).await?;
                Ok(CandidateOutcome::Applied)
            }
        }
    }

    async fn flush_candidates(&self, entry: &PeerConnectionEntry) {
        let drained = self.buffer.lock().flush(&entry.participant_id);
        for candidate in drained {
            if let Err(e) = entry.connection.add_ice_candidate(candidate).await {
                tracing::warn!(participant = %entry.participant_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Record an event reported by a connection
    ///
    /// Returns what changed, if anything. Events for participants without an
    /// entry are stale and ignored.
    pub async fn apply_event(&self, event: &PeerEvent) -> Option<PeerUpdate> {
        let entry = self.lookup(event.participant()).await?;
        match event {
            PeerEvent::StateChanged { state, .. } => {
                let mut current = entry.connection_state.lock();
                if *current == *state {
                    return None;
                }
                tracing::debug!(
                    participant = %entry.participant_id,
                    old_state = ?*current,
                    new_state = ?state,
                    "Peer connection state"
                );
                *current = *state;
                Some(PeerUpdate::StateChanged(*state))
            }
            PeerEvent::RemoteTrack { participant, track } => {
                let mut streams = self.remote_streams.write();
                let stream = streams
                    .entry(participant.clone())
                    .or_insert_with(|| RemoteStream {
                        participant: participant.clone(),
                        tracks: Vec::new(),
                    });
                if stream.tracks.iter().any(|t| t.track_id == track.track_id) {
                    return None;
                }
                stream.tracks.push(track.clone());
                Some(PeerUpdate::TrackAdded(track.clone()))
            }
            PeerEvent::LocalCandidate { .. } => None,
        }
    }

    /// Attach `track` to every connection and renegotiate
    ///
    /// Connections where attaching or offering fails get the track removed
    /// again. Returns one result per connection.
    pub async fn add_track_and_renegotiate(
        &self,
        track: Arc<LocalTrack>,
    ) -> Vec<(UserId, Result<SessionDescription, PeerError>)> {
        self.local_tracks.write().push(track.clone());
        let entries: Vec<_> = self.entries.lock().await.values().cloned().collect();

        join_all(entries.into_iter().map(|entry| {
            let track = track.clone();
            async move {
                let result = Self::renegotiate_with(&entry, track).await;
                (entry.participant_id.clone(), result)
            }
        }))
        .await
    }

    async fn renegotiate_with(
        entry: &PeerConnectionEntry,
        track: Arc<LocalTrack>,
    ) -> Result<SessionDescription, PeerError> {
        let mut negotiation = entry.negotiation.lock().await;
        let track_id = track.id().to_string();
        entry.connection.add_track(track).await?;

        let offered = async {
            let offer = entry.connection.create_offer().await?;
            entry.connection.set_local_description(offer.clone()).await?;
            Ok::<_, PeerError>(offer)
        }
        .await;

        match offered {
            Ok(offer) => {
                *negotiation = NegotiationState::HaveLocalOffer;
                Ok(offer)
            }
            Err(e) => {
                if let Err(rollback) = entry.connection.remove_track(&track_id).await {
                    tracing::warn!(participant = %entry.participant_id, error = %rollback, "Track rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Close and forget the connection to `participant`
    ///
    /// Buffered candidates are discarded. Returns `true` when the
    /// participant had a remote stream, which is now gone.
    #[tracing::instrument(skip_all, fields(participant = %participant))]
    pub async fn remove_participant(&self, participant: &UserId) -> bool {
        let entry = self.entries.lock().await.remove(participant);
        let discarded = self.buffer.lock().discard(participant);
        let had_stream = self.remote_streams.write().remove(participant).is_some();

        if let Some(entry) = entry {
            Self::close_entry(&entry).await;
            tracing::debug!(discarded, "Peer connection removed");
        }
        had_stream
    }

    async fn close_entry(entry: &PeerConnectionEntry) {
        if let Err(e) = entry.connection.close().await {
            tracing::warn!(participant = %entry.participant_id, error = %e, "Close failed");
        }
        *entry.connection_state.lock() = PeerConnectionState::Closed;
    }

    /// Close every connection and reset all per-call state
    ///
    /// Returns the participants whose remote streams were dropped.
    pub async fn close_all(&self) -> Vec<UserId> {
        let entries: Vec<_> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        join_all(entries.iter().map(|e| Self::close_entry(e))).await;

        self.buffer.lock().clear();
        self.local_tracks.write().clear();
        let mut dropped: Vec<_> = self.remote_streams.write().drain().map(|(k, _)| k).collect();
        dropped.sort();
        if !entries.is_empty() {
            tracing::info!(closed = entries.len(), "All peer connections closed");
        }
        dropped
    }
}

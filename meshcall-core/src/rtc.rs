//! Peer connections backed by the `webrtc` crate
//!
//! Each [`LocalTrack`] is mapped onto a `TrackLocalStaticSample` (Opus for
//! audio, VP8 for video). Feeding encoded samples into those tracks belongs
//! to the capture backend; this module only negotiates them.

use crate::identity::UserId;
use crate::media::LocalTrack;
use crate::peer::{PeerError, PeerEventSink, PeerFactory, RtcPeer};
use crate::types::{
    IceCandidate, IceServer, MediaKind, PeerConnectionState, RemoteTrackInfo, SdpType,
    SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "meshcall";

fn engine_error(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| PeerError::Negotiation(format!("invalid SDP: {e}")))
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(PeerError::Negotiation(format!("unexpected SDP type {other}"))),
    }
}

/// [`PeerFactory`] creating `webrtc` peer connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip_all, fields(participant = %participant))]
    async fn create_peer(
        &self,
        participant: &UserId,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Setup(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::Setup(e.to_string()))?,
        );
        wire_handlers(&connection, events);

        tracing::debug!("WebRTC peer connection created");
        Ok(Arc::new(WebRtcPeer {
            connection,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn wire_handlers(connection: &RTCPeerConnection, events: PeerEventSink) {
    let sink = events.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(state) = map_state(state) {
            sink.state_changed(state);
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => sink.local_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }),
                Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    connection.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        sink.remote_track(RemoteTrackInfo {
            track_id: track.id(),
            kind,
        });
        Box::pin(async {})
    }));
}

/// A `webrtc` peer connection
pub struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;
        self.senders.lock().insert(track.id().to_owned(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => self
                .connection
                .remove_track(&sender)
                .await
                .map_err(engine_error),
            None => Ok(()),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.connection.create_offer(None).await.map_err(engine_error)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(engine_error)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        // The engine parses the SDP of a rollback too, so reuse the pending offer.
        let Some(pending) = self.connection.pending_local_description().await else {
            return Ok(());
        };
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.connection
            .set_local_description(rollback)
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(engine_error)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        self.connection.close().await.map_err(engine_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn peer(name: &str) -> Arc<dyn RtcPeer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        WebRtcPeerFactory::new()
            .create_peer(&UserId::new(name), &[], PeerEventSink::new(UserId::new(name), tx))
            .await
            .unwrap()
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(PeerConnectionState::Connected)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_peers() {
        let alice = peer("alice").await;
        let bob = peer("bob").await;
        alice
            .add_track(Arc::new(LocalTrack::new(MediaKind::Audio, "mic")))
            .await
            .unwrap();

        let offer = alice.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("opus"));
        alice.set_local_description(offer.clone()).await.unwrap();

        bob.set_remote_description(offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        bob.set_local_description(answer.clone()).await.unwrap();
        alice.set_remote_description(answer).await.unwrap();

        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_unknown_track_is_noop() {
        let alice = peer("alice").await;
        alice.remove_track("missing").await.unwrap();
        alice.close().await.unwrap();
    }
}

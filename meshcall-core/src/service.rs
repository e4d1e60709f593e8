//! Call engine wiring

use crate::call::{CallConfig, CallContext, CallError, CallOrchestrator, CallOutcome};
use crate::directory::CallDirectory;
use crate::identity::LocalUser;
use crate::media::{MediaController, MediaDevices};
use crate::peer::{PeerConnectionManager, PeerEvent, PeerFactory};
use crate::signaling::{GatewayEvent, SignalingClient, SignalingGateway};
use crate::types::{CallEvent, CallId, CallType, GroupId, MediaKind, SessionSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A required collaborator was not supplied to the builder
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// `start` was called twice
    #[error("Engine already started")]
    AlreadyStarted,

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local profile
    pub local_user: LocalUser,
    /// Orchestrator settings
    pub call: CallConfig,
    /// Capacity of the call event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_user: LocalUser::default(),
            call: CallConfig::default(),
            event_capacity: 256,
        }
    }
}

/// A configured call engine
///
/// Owns the [`CallOrchestrator`] and the dispatch loop that feeds it
/// gateway and peer connection events.
pub struct CallEngine {
    orchestrator: Arc<CallOrchestrator>,
    peer_events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    shutdown: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CallEngine {
    /// Create a builder
    #[must_use]
    pub fn builder() -> CallEngineBuilder {
        CallEngineBuilder::new()
    }

    /// The orchestrator behind this engine
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    /// Start the dispatch loop
    ///
    /// # Errors
    ///
    /// Returns error if the engine was already started
    #[tracing::instrument(skip(self), fields(user = %self.orchestrator.local_user().id))]
    pub fn start(&self) -> Result<(), ServiceError> {
        let peer_events = self
            .peer_events
            .lock()
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;
        let gateway_events = self.orchestrator.signaling().subscribe();

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.orchestrator),
            gateway_events,
            peer_events,
            self.shutdown.clone(),
        ));
        *self.dispatch.lock() = Some(handle);

        tracing::info!("Call engine started");
        Ok(())
    }

    /// Leave any call and stop the dispatch loop
    #[tracing::instrument(skip(self), fields(user = %self.orchestrator.local_user().id))]
    pub async fn shutdown(&self) {
        match self.orchestrator.leave_call().await {
            Ok(()) | Err(CallError::NoActiveCall) => {}
            Err(e) => tracing::warn!(error = %e, "Leaving on shutdown failed"),
        }
        self.shutdown.cancel();
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch loop panicked");
            }
        }
        tracing::info!("Call engine stopped");
    }

    /// Start or reuse a call in `group_id`
    ///
    /// # Errors
    ///
    /// See [`CallOrchestrator::start_call`]
    pub async fn start_call(
        &self,
        group_id: GroupId,
        call_type: CallType,
    ) -> Result<CallOutcome, CallError> {
        self.orchestrator.start_call(group_id, call_type).await
    }

    /// Join a call
    ///
    /// # Errors
    ///
    /// See [`CallOrchestrator::join_call`]
    pub async fn join_call(&self, call_id: CallId) -> Result<CallOutcome, CallError> {
        self.orchestrator.join_call(call_id).await
    }

    /// Leave the current call
    ///
    /// # Errors
    ///
    /// See [`CallOrchestrator::leave_call`]
    pub async fn leave_call(&self) -> Result<(), CallError> {
        self.orchestrator.leave_call().await
    }

    /// End the current call for everyone
    ///
    /// # Errors
    ///
    /// See [`CallOrchestrator::end_call`]
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.orchestrator.end_call().await
    }

    /// Toggle a local media kind
    ///
    /// # Errors
    ///
    /// See [`CallOrchestrator::toggle_media`]
    pub async fn toggle_media(&self, kind: MediaKind) -> Result<bool, CallError> {
        self.orchestrator.toggle_media(kind).await
    }

    /// Current session snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.orchestrator.snapshot()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.orchestrator.subscribe()
    }

    /// Observe session snapshots
    #[must_use]
    pub fn on_state_change(&self) -> watch::Receiver<SessionSnapshot> {
        self.orchestrator.on_state_change()
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch_loop(
    orchestrator: Arc<CallOrchestrator>,
    mut gateway_events: broadcast::Receiver<GatewayEvent>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = gateway_events.recv() => match event {
                Ok(event) => orchestrator.handle_gateway_event(event).await,
                // Skipped events are lost: a missed negotiation message is
                // recovered by link-failure eviction, missed membership by
                // the next announcement or rejoin.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dispatch loop lagged behind the gateway");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("Gateway channel closed");
                    break;
                }
            },
            Some(event) = peer_events.recv() => orchestrator.handle_peer_event(event).await,
        }
    }
    tracing::debug!("Dispatch loop exited");
}

/// Call engine builder
pub struct CallEngineBuilder {
    config: EngineConfig,
    gateway: Option<Arc<dyn SignalingGateway>>,
    directory: Option<Arc<dyn CallDirectory>>,
    devices: Option<Arc<dyn MediaDevices>>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
}

impl CallEngineBuilder {
    /// Create new builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            gateway: None,
            directory: None,
            devices: None,
            peer_factory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local profile
    #[must_use]
    pub fn with_local_user(mut self, user: LocalUser) -> Self {
        self.config.local_user = user;
        self
    }

    /// Set the signaling gateway
    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<dyn SignalingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the call directory
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn CallDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the capture devices
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the peer connection factory
    ///
    /// Defaults to the `webrtc` backend when that feature is enabled.
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    #[cfg(feature = "webrtc-backend")]
    fn default_peer_factory() -> Option<Arc<dyn PeerFactory>> {
        Some(Arc::new(crate::rtc::WebRtcPeerFactory::new()))
    }

    #[cfg(not(feature = "webrtc-backend"))]
    fn default_peer_factory() -> Option<Arc<dyn PeerFactory>> {
        None
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing
    pub fn build(self) -> Result<CallEngine, ServiceError> {
        let gateway = self
            .gateway
            .ok_or(ServiceError::MissingCollaborator("signaling gateway"))?;
        let directory = self
            .directory
            .ok_or(ServiceError::MissingCollaborator("call directory"))?;
        let devices = self
            .devices
            .ok_or(ServiceError::MissingCollaborator("media devices"))?;
        let factory = self
            .peer_factory
            .or_else(Self::default_peer_factory)
            .ok_or(ServiceError::MissingCollaborator("peer factory"))?;

        let EngineConfig {
            local_user,
            call,
            event_capacity,
        } = self.config;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let context = CallContext {
            signaling: SignalingClient::new(
                gateway,
                call.invoke_timeout,
                call.invoke_retry.clone(),
            ),
            directory,
            media: Arc::new(MediaController::new(devices)),
            peers: Arc::new(PeerConnectionManager::new(
                local_user.id.clone(),
                factory,
                peer_tx,
            )),
            local_user,
        };

        Ok(CallEngine {
            orchestrator: CallOrchestrator::new(context, call, event_capacity),
            peer_events: Mutex::new(Some(peer_rx)),
            shutdown: CancellationToken::new(),
            dispatch: Mutex::new(None),
        })
    }
}

impl Default for CallEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::loopback::{LoopbackHub, SyntheticDevices};
    use crate::peer::{PeerError, PeerEventSink, RtcPeer};
    use crate::types::{CallState, IceServer};
    use async_trait::async_trait;
    use std::time::Duration;

    struct RefusingFactory;

    #[async_trait]
    impl PeerFactory for RefusingFactory {
        async fn create_peer(
            &self,
            _participant: &UserId,
            _ice_servers: &[IceServer],
            _events: PeerEventSink,
        ) -> Result<Arc<dyn RtcPeer>, PeerError> {
            Err(PeerError::Setup("refused".into()))
        }
    }

    fn engine(hub: &Arc<LoopbackHub>, name: &str) -> CallEngine {
        let user = LocalUser::new(name, name.to_uppercase());
        CallEngine::builder()
            .with_gateway(hub.connect(&user))
            .with_directory(hub.clone())
            .with_devices(Arc::new(SyntheticDevices::new()))
            .with_peer_factory(Arc::new(RefusingFactory))
            .with_local_user(user)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_gateway() {
        let err = CallEngine::builder().build().err().unwrap();
        assert!(matches!(err, ServiceError::MissingCollaborator("signaling gateway")));
    }

    #[test]
    fn test_engine_config_from_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"local_user": {"id": "alice", "display_name": "Alice"}}"#)
                .unwrap();
        assert_eq!(config.local_user.id, UserId::new("alice"));
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.call, CallConfig::default());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let hub = LoopbackHub::new();
        let alice = engine(&hub, "alice");
        alice.start().unwrap();
        assert!(matches!(alice.start(), Err(ServiceError::AlreadyStarted)));
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_loop_surfaces_incoming_call() {
        let hub = LoopbackHub::new();
        let alice = engine(&hub, "alice");
        let bob = engine(&hub, "bob");
        alice.start().unwrap();
        bob.start().unwrap();
        let mut bob_events = bob.subscribe();

        let outcome = alice
            .start_call(GroupId::new("g1"), CallType::Audio)
            .await
            .unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(CallEvent::IncomingCall { call_id, .. }) = bob_events.recv().await {
                    return call_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(Some(incoming), outcome.call_id());
        assert_eq!(
            bob.snapshot().state,
            CallState::Connecting(crate::types::CallDirection::Incoming)
        );

        alice.shutdown().await;
        bob.shutdown().await;
    }
}

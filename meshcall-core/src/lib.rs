//! Meshcall - group audio/video calls over a WebRTC mesh
//!
//! Every participant holds one peer connection to every other participant.
//! Call control and SDP/ICE negotiation travel over a real-time signaling
//! channel abstracted by [`SignalingGateway`]; call registration and ICE
//! server lookup go through a [`CallDirectory`]. The library provides:
//!
//! - **Session orchestration**: start, join, leave and end with a single
//!   connecting-lock and snapshot-based observation
//! - **Mesh management**: one connection per remote participant, glare
//!   resolution, early ICE candidate buffering
//! - **Local media**: capture with audio-only fallback, mute toggles, late
//!   camera upgrade with renegotiation
//! - **WebRTC backend**: peer connections from the `webrtc` crate
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::prelude::*;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let alice = LocalUser::new("alice", "Alice");
//!
//! let engine = CallEngine::builder()
//!     .with_gateway(hub.connect(&alice))
//!     .with_directory(hub.clone())
//!     .with_devices(std::sync::Arc::new(SyntheticDevices::new()))
//!     .with_local_user(alice)
//!     .build()?;
//! engine.start()?;
//!
//! let outcome = engine.start_call(GroupId::new("team"), CallType::Video).await?;
//! println!("call {:?}", outcome.call_id());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// User identity
pub mod identity;

/// Bounded retry policy
pub mod retry;

/// Signaling protocol and client
pub mod signaling;

/// Call directory (REST side)
pub mod directory;

/// ICE candidate buffering
pub mod ice;

/// Local media capture
pub mod media;

/// Peer connection management
pub mod peer;

/// Per-participant outbound negotiation queues
pub mod outbox;

/// `webrtc` crate backend
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

/// Call session orchestration
pub mod call;

/// Engine wiring and configuration
pub mod service;

/// In-process signaling hub and synthetic devices
pub mod loopback;

pub use call::{CallConfig, CallContext, CallError, CallOrchestrator, CallOutcome};
pub use directory::{ActiveCallInfo, CallDirectory, DirectoryError};
pub use identity::{LocalUser, UserId};
pub use loopback::{LoopbackGateway, LoopbackHub, SyntheticDevices};
pub use media::{
    CaptureConstraints, LocalStream, LocalTrack, MediaController, MediaDevices, MediaError,
};
pub use peer::{PeerConnectionManager, PeerError, PeerEvent, PeerFactory, RtcPeer};
pub use retry::RetryPolicy;
#[cfg(feature = "webrtc-backend")]
pub use rtc::WebRtcPeerFactory;
pub use service::{CallEngine, CallEngineBuilder, EngineConfig, ServiceError};
pub use signaling::{
    GatewayEvent, GatewayState, SignalingClient, SignalingError, SignalingGateway,
    SignalingMessage,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError, CallOrchestrator, CallOutcome};
    pub use crate::directory::CallDirectory;
    pub use crate::identity::{LocalUser, UserId};
    pub use crate::loopback::{LoopbackHub, SyntheticDevices};
    pub use crate::media::MediaDevices;
    pub use crate::peer::PeerFactory;
    pub use crate::service::{CallEngine, EngineConfig};
    pub use crate::signaling::SignalingGateway;
    pub use crate::types::{
        CallEvent, CallId, CallState, CallType, GroupId, MediaKind, SessionSnapshot,
    };
}

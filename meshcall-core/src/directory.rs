//! Call directory
//!
//! The application's REST side: which call is active in a group, call
//! registration, and STUN/TURN credentials. The engine only consumes it.

use crate::identity::{LocalUser, UserId};
use crate::signaling::ParticipantInfo;
use crate::types::{Call, CallId, CallState, CallType, GroupId, IceServer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Call not found
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Request failed
    #[error("Directory request failed: {0}")]
    RequestFailed(String),
}

/// A call as known by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallInfo {
    /// Call identifier
    pub call_id: CallId,
    /// Group of the call
    pub group_id: GroupId,
    /// Audio or video
    pub call_type: CallType,
    /// Who started it
    pub initiator_id: UserId,
    /// Registered participants
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
}

impl ActiveCallInfo {
    /// Session record for this call with its registered participants
    #[must_use]
    pub fn into_call(self, state: CallState) -> Call {
        let mut call = Call::new(
            self.call_id,
            self.group_id,
            self.call_type,
            self.initiator_id,
            state,
        );
        for participant in self.participants {
            call.add_participant(participant.into_participant());
        }
        call
    }
}

/// REST collaborator used by the orchestrator
#[async_trait]
pub trait CallDirectory: Send + Sync {
    /// Active call for a group, if any
    async fn active_call(&self, group_id: &GroupId) -> Result<Option<ActiveCallInfo>, DirectoryError>;

    /// Register a new call started by `initiator`
    async fn create_call(
        &self,
        group_id: &GroupId,
        call_type: CallType,
        initiator: &LocalUser,
    ) -> Result<ActiveCallInfo, DirectoryError>;

    /// Register `user` as a participant and return the call with its
    /// participants before the join
    async fn join_call(&self, call_id: CallId, user: &LocalUser) -> Result<ActiveCallInfo, DirectoryError>;

    /// STUN/TURN servers for the next call
    async fn ice_servers(&self) -> Result<Vec<IceServer>, DirectoryError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::CallDirection;

    #[test]
    fn test_into_call_keeps_registered_participants() {
        let info: ActiveCallInfo = serde_json::from_value(serde_json::json!({
            "callId": CallId::new(),
            "groupId": "team",
            "callType": "video",
            "initiatorId": "alice",
            "participants": [{
                "userId": "alice",
                "displayName": "Alice",
                "isAudioEnabled": true,
                "isVideoEnabled": true
            }]
        }))
        .unwrap();
        let call_id = info.call_id;

        let call = info.into_call(CallState::Connecting(CallDirection::Incoming));
        assert_eq!(call.id, call_id);
        assert_eq!(call.call_type, CallType::Video);
        assert_eq!(call.state, CallState::Connecting(CallDirection::Incoming));
        assert!(call.is_initiator(&UserId::new("alice")));
        assert!(call.participants[&UserId::new("alice")].is_video_enabled);
    }
}

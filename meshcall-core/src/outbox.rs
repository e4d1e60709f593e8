//! Outbound negotiation queues
//!
//! Answers and local candidates produced while handling inbound events are
//! queued per participant. One worker task drains each queue, so a send
//! that hangs towards one participant holds up neither the dispatch loop
//! nor the other participants, and each participant still receives its
//! messages in the order they were produced.

use crate::identity::UserId;
use crate::signaling::{Envelope, SignalingClient, SignalingError};
use crate::types::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Message waiting to be sent to one participant
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Offer or answer
    Description(Envelope<SessionDescription>),
    /// Local ICE candidate
    Candidate(Envelope<IceCandidate>),
}

impl Outbound {
    /// Participant the message is addressed to
    #[must_use]
    pub fn target(&self) -> &UserId {
        match self {
            Self::Description(envelope) => &envelope.target_user_id,
            Self::Candidate(envelope) => &envelope.target_user_id,
        }
    }

    async fn send(&self, signaling: &SignalingClient) -> Result<(), SignalingError> {
        match self {
            Self::Description(envelope) if envelope.payload.sdp_type == SdpType::Offer => {
                signaling.send_offer(envelope).await
            }
            Self::Description(envelope) => signaling.send_answer(envelope).await,
            Self::Candidate(envelope) => signaling.send_ice_candidate(envelope).await,
        }
    }
}

/// Per-participant FIFO queues drained by background workers
pub struct SignalOutbox {
    signaling: SignalingClient,
    queues: Mutex<HashMap<UserId, mpsc::UnboundedSender<Outbound>>>,
}

impl SignalOutbox {
    /// Create an empty outbox sending through `signaling`
    #[must_use]
    pub fn new(signaling: SignalingClient) -> Self {
        Self {
            signaling,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `message` behind everything already queued for its target
    ///
    /// Must be called from within a Tokio runtime.
    pub fn push(&self, message: Outbound) {
        let target = message.target().clone();
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(target.clone())
            .or_insert_with(|| self.spawn_worker(&target));
        if let Err(mpsc::error::SendError(message)) = queue.send(message) {
            tracing::debug!(participant = %target, "Outbox worker gone, restarting it");
            let queue = self.spawn_worker(&target);
            let _ = queue.send(message);
            queues.insert(target, queue);
        }
    }

    /// Stop accepting messages for `participant`
    ///
    /// Messages already queued are still sent.
    pub fn close(&self, participant: &UserId) {
        self.queues.lock().remove(participant);
    }

    /// Close every queue
    pub fn clear(&self) {
        self.queues.lock().clear();
    }

    /// Participants with an open queue
    #[must_use]
    pub fn open_queues(&self) -> usize {
        self.queues.lock().len()
    }

    fn spawn_worker(&self, participant: &UserId) -> mpsc::UnboundedSender<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(self.signaling.clone(), participant.clone(), rx));
        tx
    }
}

async fn drain(
    signaling: SignalingClient,
    participant: UserId,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = message.send(&signaling).await {
            tracing::warn!(participant = %participant, error = %e, "Queued signaling send failed");
        }
    }
    tracing::trace!(participant = %participant, "Outbox queue closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::signaling::{GatewayEvent, GatewayState, SignalingGateway};
    use crate::types::CallId;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Records invokes; answers never complete
    struct SlowAnswers {
        invoked: Mutex<Vec<String>>,
        events: broadcast::Sender<GatewayEvent>,
    }

    #[async_trait]
    impl SignalingGateway for SlowAnswers {
        async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<(), SignalingError> {
            self.invoked.lock().push(method.to_string());
            if method == "SendGroupCallAnswer" {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
            self.events.subscribe()
        }

        fn connection_state(&self) -> GatewayState {
            GatewayState::Connected
        }
    }

    fn outbox() -> (SignalOutbox, Arc<SlowAnswers>) {
        let (events, _) = broadcast::channel(4);
        let gateway = Arc::new(SlowAnswers {
            invoked: Mutex::new(Vec::new()),
            events,
        });
        let client = SignalingClient::new(
            gateway.clone(),
            Duration::from_secs(5),
            RetryPolicy::fallback_names(),
        );
        (SignalOutbox::new(client), gateway)
    }

    fn envelope<T>(to: &str, payload: T) -> Envelope<T> {
        Envelope {
            call_id: CallId::new(),
            from_user_id: UserId::new("alice"),
            target_user_id: UserId::new(to),
            payload,
        }
    }

    async fn settle(gateway: &SlowAnswers, expected: usize) {
        for _ in 0..100 {
            if gateway.invoked.lock().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_messages_to_one_participant_keep_their_order() {
        let (outbox, gateway) = outbox();
        outbox.push(Outbound::Description(envelope(
            "bob",
            SessionDescription::offer("v=0 offer"),
        )));
        for n in 0..2 {
            outbox.push(Outbound::Candidate(envelope(
                "bob",
                IceCandidate::new(format!("candidate:{n}")),
            )));
        }

        settle(&gateway, 3).await;
        assert_eq!(
            gateway.invoked.lock().clone(),
            vec![
                "SendGroupCallOffer",
                "SendGroupIceCandidate",
                "SendGroupIceCandidate"
            ]
        );
        assert_eq!(outbox.open_queues(), 1);
    }

    #[tokio::test]
    async fn test_hanging_send_does_not_hold_up_other_participants() {
        let (outbox, gateway) = outbox();
        outbox.push(Outbound::Description(envelope(
            "zed",
            SessionDescription::answer("v=0 answer"),
        )));
        outbox.push(Outbound::Candidate(envelope(
            "zed",
            IceCandidate::new("candidate:stuck"),
        )));
        outbox.push(Outbound::Candidate(envelope(
            "yan",
            IceCandidate::new("candidate:free"),
        )));

        settle(&gateway, 2).await;
        let mut invoked = gateway.invoked.lock().clone();
        invoked.sort();
        assert_eq!(invoked, vec!["SendGroupCallAnswer", "SendGroupIceCandidate"]);
    }

    #[tokio::test]
    async fn test_closed_queue_is_reopened_on_next_push() {
        let (outbox, gateway) = outbox();
        outbox.push(Outbound::Candidate(envelope("bob", IceCandidate::new("candidate:0"))));
        outbox.close(&UserId::new("bob"));
        assert_eq!(outbox.open_queues(), 0);

        outbox.push(Outbound::Candidate(envelope("bob", IceCandidate::new("candidate:1"))));
        assert_eq!(outbox.open_queues(), 1);
        settle(&gateway, 2).await;
        assert_eq!(gateway.invoked.lock().len(), 2);

        outbox.clear();
        assert_eq!(outbox.open_queues(), 0);
    }
}

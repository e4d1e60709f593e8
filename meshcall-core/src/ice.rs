//! ICE candidate buffering
//!
//! Candidates can reach us before the offer or answer they belong to has
//! been applied. A candidate added to a connection without a remote
//! description is rejected by the media engine, so every early candidate is
//! parked here, per participant and in arrival order, until the first remote
//! description for that participant is set.

use crate::identity::UserId;
use crate::types::IceCandidate;
use std::collections::{HashMap, VecDeque};

/// What to do with a candidate handed to the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Queued; holds the queue length after the push
    Buffered(usize),
    /// Remote description already set, apply now
    Apply(IceCandidate),
}

/// Counters kept per participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Candidates that went through the queue
    pub buffered: u64,
    /// Buffered candidates released by a flush
    pub flushed: u64,
}

#[derive(Debug, Default)]
struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
    stats: BufferStats,
}

/// Per-participant FIFO of early ICE candidates
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queues: HashMap<UserId, CandidateQueue>,
}

impl IceCandidateBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `candidate` unless `participant` already has a remote description
    pub fn enqueue_or_apply(&mut self, participant: &UserId, candidate: IceCandidate) -> Disposition {
        let queue = self.queues.entry(participant.clone()).or_default();
        if queue.remote_description_set {
            return Disposition::Apply(candidate);
        }
        queue.pending.push_back(candidate);
        queue.stats.buffered += 1;
        tracing::trace!(
            participant = %participant,
            pending = queue.pending.len(),
            "ICE candidate buffered"
        );
        Disposition::Buffered(queue.pending.len())
    }

    /// Mark the remote description as set and release the queue
    ///
    /// Only the first call per participant returns candidates; later calls
    /// (renegotiation) find the flag already set and return nothing, since
    /// candidates arriving after the first flush are applied directly.
    pub fn flush(&mut self, participant: &UserId) -> Vec<IceCandidate> {
        let queue = self.queues.entry(participant.clone()).or_default();
        if queue.remote_description_set {
            return Vec::new();
        }
        queue.remote_description_set = true;
        let drained: Vec<_> = queue.pending.drain(..).collect();
        queue.stats.flushed += drained.len() as u64;
        if !drained.is_empty() {
            tracing::debug!(
                participant = %participant,
                count = drained.len(),
                "Flushing buffered ICE candidates"
            );
        }
        drained
    }

    /// Forget a participant, dropping anything still queued
    ///
    /// Returns the number of candidates discarded.
    pub fn discard(&mut self, participant: &UserId) -> usize {
        match self.queues.remove(participant) {
            Some(queue) => {
                if !queue.pending.is_empty() {
                    tracing::debug!(
                        participant = %participant,
                        count = queue.pending.len(),
                        "Discarding buffered ICE candidates"
                    );
                }
                queue.pending.len()
            }
            None => 0,
        }
    }

    /// Candidates waiting for `participant`
    #[must_use]
    pub fn pending_len(&self, participant: &UserId) -> usize {
        self.queues
            .get(participant)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Whether a remote description was applied for `participant`
    #[must_use]
    pub fn has_remote_description(&self, participant: &UserId) -> bool {
        self.queues
            .get(participant)
            .is_some_and(|queue| queue.remote_description_set)
    }

    /// Counters for `participant`
    #[must_use]
    pub fn stats(&self, participant: &UserId) -> BufferStats {
        self.queues
            .get(participant)
            .map(|queue| queue.stats)
            .unwrap_or_default()
    }

    /// Drop every queue
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn test_candidates_are_buffered_until_flush_in_arrival_order() {
        let mut buffer = IceCandidateBuffer::new();
        let bob = UserId::new("bob");

        for n in 1..=3 {
            assert_eq!(
                buffer.enqueue_or_apply(&bob, candidate(n)),
                Disposition::Buffered(n as usize)
            );
        }

        let flushed = buffer.flush(&bob);
        assert_eq!(flushed, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(buffer.pending_len(&bob), 0);

        let stats = buffer.stats(&bob);
        assert_eq!(stats.buffered, stats.flushed);
    }

    #[test]
    fn test_candidates_after_flush_apply_immediately() {
        let mut buffer = IceCandidateBuffer::new();
        let bob = UserId::new("bob");
        buffer.flush(&bob);

        assert_eq!(
            buffer.enqueue_or_apply(&bob, candidate(9)),
            Disposition::Apply(candidate(9))
        );
        assert!(buffer.flush(&bob).is_empty());
    }

    #[test]
    fn test_participants_are_independent() {
        let mut buffer = IceCandidateBuffer::new();
        let bob = UserId::new("bob");
        let carol = UserId::new("carol");

        buffer.enqueue_or_apply(&bob, candidate(1));
        buffer.enqueue_or_apply(&carol, candidate(2));
        buffer.flush(&bob);

        assert_eq!(buffer.pending_len(&carol), 1);
        assert!(!buffer.has_remote_description(&carol));
        assert!(buffer.has_remote_description(&bob));
    }

    #[test]
    fn test_discard_drops_queue_without_flushing() {
        let mut buffer = IceCandidateBuffer::new();
        let bob = UserId::new("bob");
        buffer.enqueue_or_apply(&bob, candidate(1));
        buffer.enqueue_or_apply(&bob, candidate(2));

        assert_eq!(buffer.discard(&bob), 2);
        assert_eq!(buffer.pending_len(&bob), 0);
        assert!(buffer.flush(&bob).is_empty());
    }
}

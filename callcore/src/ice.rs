//! Buffer for remote ICE candidates that arrive before the remote description.
//!
//! A candidate may only be handed to the peer session once a remote
//! description has been applied. Until then candidates are held in receipt
//! order and released in one batch.

use std::collections::VecDeque;

use crate::signaling::IceCandidate;

#[derive(Debug, Default)]
pub struct RemoteCandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_description_applied: bool,
}

impl RemoteCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the candidate back if it can be applied right away, otherwise
    /// keeps it.
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_applied {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Record that the remote description is in place and hand back every
    /// buffered candidate, oldest first.
    ///
    /// Only the first call drains; the queue stays empty afterwards.
    pub fn mark_applied(&mut self) -> Vec<IceCandidate> {
        if self.remote_description_applied {
            return Vec::new();
        }
        self.remote_description_applied = true;
        self.pending.drain(..).collect()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.remote_description_applied = false;
    }
}

use std::fmt;

use serde::Serialize;

/// Opaque identifier of one call attempt, used for logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 32 uppercase hex characters.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The one active call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub room_id: String,
    pub peer_id: String,
    pub is_initiator: bool,
    /// Guards against completions that belong to an earlier session.
    pub generation: u64,
}

impl CallSession {
    pub fn outgoing(room_id: impl Into<String>, peer_id: impl Into<String>, generation: u64) -> Self {
        Self {
            call_id: CallId::generate(),
            room_id: room_id.into(),
            peer_id: peer_id.into(),
            is_initiator: true,
            generation,
        }
    }

    pub fn incoming(room_id: impl Into<String>, peer_id: impl Into<String>, generation: u64) -> Self {
        Self {
            is_initiator: false,
            ..Self::outgoing(room_id, peer_id, generation)
        }
    }

    /// Whether a signal from `sender_id` in `room_id` belongs to this call.
    pub fn involves(&self, room_id: &str, sender_id: &str) -> bool {
        self.room_id == room_id && self.peer_id == sender_id
    }
}

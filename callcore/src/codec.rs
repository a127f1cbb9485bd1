//! Envelope codec for signals carried inside chat relay messages.
//!
//! The relay broadcasts every envelope to the whole room, so addressing is
//! logical: the codec drops anything targeted at someone else, and anything
//! we sent ourselves.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signaling::{SignalKind, SignalingMessage};

/// Value of `messageType` that marks a chat relay message as a call signal.
pub const SIGNAL_MESSAGE_TYPE: &str = "webrtc_signal";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed signal json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed signal: {0}")]
    Malformed(String),

    #[error("not a call signal (messageType={0})")]
    NotSignal(String),

    #[error("unknown signal type: {0}")]
    UnknownKind(String),

    #[error("{0} signal without payload")]
    MissingPayload(SignalKind),

    #[error("signal addressed to {0}")]
    Misdirected(String),

    #[error("own signal echoed by relay")]
    Echo,
}

/// Wire shape of a signal inside the chat transport's message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub message_type: String,
    pub room_id: String,
    pub signal_type: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl From<&SignalingMessage> for SignalEnvelope {
    fn from(msg: &SignalingMessage) -> Self {
        Self {
            message_type: SIGNAL_MESSAGE_TYPE.to_string(),
            room_id: msg.room_id.clone(),
            signal_type: msg.kind.tag_name().to_string(),
            sender_id: msg.sender_id.clone(),
            target_id: msg.target_id.clone(),
            data: msg.payload.clone(),
        }
    }
}

/// Encodes outbound signals and filters inbound ones for one local identity.
#[derive(Debug, Clone)]
pub struct SignalCodec {
    local_id: String,
}

impl SignalCodec {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn encode(&self, msg: &SignalingMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&SignalEnvelope::from(msg))?)
    }

    /// Decode and validate an inbound envelope.
    ///
    /// Any error means the envelope must be dropped; none of them is fatal.
    pub fn decode(&self, raw: &str) -> Result<SignalingMessage, CodecError> {
        let envelope: SignalEnvelope = serde_json::from_str(raw)?;

        if envelope.message_type != SIGNAL_MESSAGE_TYPE {
            return Err(CodecError::NotSignal(envelope.message_type));
        }

        let kind = SignalKind::from_tag(&envelope.signal_type)
            .ok_or_else(|| CodecError::UnknownKind(envelope.signal_type.clone()))?;

        if envelope.sender_id == self.local_id {
            return Err(CodecError::Echo);
        }

        if let Some(target) = envelope.target_id.as_deref()
            && target != self.local_id
        {
            return Err(CodecError::Misdirected(target.to_string()));
        }

        let msg = SignalingMessage {
            kind,
            room_id: envelope.room_id,
            sender_id: envelope.sender_id,
            target_id: envelope.target_id,
            payload: envelope.data.filter(|d| !d.is_empty()),
        };

        // Reject bad nested payloads here so the state machine only sees
        // signals it can act on.
        msg.body()?;

        debug!(
            "Decoded {} from {} in room {}",
            msg.kind, msg.sender_id, msg.room_id
        );
        Ok(msg)
    }
}

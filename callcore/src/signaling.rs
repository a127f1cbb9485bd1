//! Signaling message model.
//!
//! Seven signal kinds ride on the chat relay: four call lifecycle signals
//! with no payload, and three negotiation signals carrying a nested JSON
//! document (a session description or an ICE candidate).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Kind discriminator carried in the envelope's `signalType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Caller asks the callee to ring.
    CallRequest,
    /// Callee picked up; the caller may now create the offer.
    CallAccepted,
    /// Callee declined (or was busy).
    CallRejected,
    /// Either side hung up.
    CallEnded,
    /// Initiator's session description.
    Offer,
    /// Answerer's session description.
    Answer,
    /// One trickled ICE candidate.
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        Self::CallRequest,
        Self::CallAccepted,
        Self::CallRejected,
        Self::CallEnded,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
    ];

    /// Wire name used in the envelope.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallEnded => "call-ended",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag_name() == tag)
    }

    /// Lifecycle signals drive the call state machine directly.
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::CallRequest | Self::CallAccepted | Self::CallRejected | Self::CallEnded
        )
    }

    pub const fn carries_payload(&self) -> bool {
        !self.is_lifecycle()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiated media-capability document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A candidate network path, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index: index,
        }
    }
}

/// Typed view of a message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Lifecycle,
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// One logical signal, addressed within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub room_id: String,
    pub sender_id: String,
    pub target_id: Option<String>,
    /// Nested JSON for Offer/Answer/IceCandidate, empty otherwise.
    pub payload: Option<String>,
}

impl SignalingMessage {
    /// Build a payload-less lifecycle signal.
    pub fn lifecycle(
        kind: SignalKind,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        target_id: Option<String>,
    ) -> Self {
        debug_assert!(kind.is_lifecycle());
        Self {
            kind,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            target_id,
            payload: None,
        }
    }

    /// Wrap a local session description as an Offer or Answer signal.
    pub fn description(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        target_id: Option<String>,
        description: &SessionDescription,
    ) -> Result<Self, CodecError> {
        let kind = match description.sdp_type {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
        };
        Ok(Self {
            kind,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            target_id,
            payload: Some(serde_json::to_string(description)?),
        })
    }

    pub fn candidate(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        target_id: Option<String>,
        candidate: &IceCandidate,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            kind: SignalKind::IceCandidate,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            target_id,
            payload: Some(serde_json::to_string(candidate)?),
        })
    }

    /// Parse the nested payload according to the kind.
    pub fn body(&self) -> Result<SignalBody, CodecError> {
        if self.kind.is_lifecycle() {
            return Ok(SignalBody::Lifecycle);
        }
        let raw = self
            .payload
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(CodecError::MissingPayload(self.kind))?;

        match self.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let description: SessionDescription = serde_json::from_str(raw)?;
                let expected = if self.kind == SignalKind::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if description.sdp_type != expected {
                    return Err(CodecError::Malformed(format!(
                        "{} signal carries a {:?} description",
                        self.kind, description.sdp_type
                    )));
                }
                Ok(SignalBody::Description(description))
            }
            _ => Ok(SignalBody::Candidate(serde_json::from_str(raw)?)),
        }
    }
}

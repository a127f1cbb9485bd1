//! Platform-agnostic core of the one-to-one audio call protocol.
//!
//! Nothing in here touches a runtime or a socket: the call state table, the
//! signaling message model, the envelope codec and the remote ICE candidate
//! buffer are all plain data structures driven by the runtime crate.

pub mod codec;
pub mod ice;
pub mod signaling;
pub mod state;
pub mod types;

pub use codec::{CodecError, SIGNAL_MESSAGE_TYPE, SignalCodec, SignalEnvelope};
pub use ice::RemoteCandidateQueue;
pub use signaling::{
    IceCandidate, SdpType, SessionDescription, SignalBody, SignalKind, SignalingMessage,
};
pub use state::{CallState, CallTransition, InvalidTransition};
pub use types::{CallId, CallSession};

//! One-to-one audio calls negotiated over a chat relay.
//!
//! The platform-agnostic protocol pieces live in [`callcore`]; this crate
//! adds the tokio runtime around them: the call manager's event loop, the
//! session negotiation engine, local media control and a webrtc-rs backed
//! peer session.

pub use callcore::{
    CallId, CallSession, CallState, CodecError, IceCandidate, SdpType, SessionDescription,
    SignalKind, SignalingMessage,
};

pub mod calls;
pub mod config;

pub use calls::{CallError, CallEvent, CallManager, CallSnapshot};
pub use config::{BusyPolicy, CallConfig};

//! Audio call signaling over the chat relay.
//!
//! # Architecture
//!
//! - [`CallManager`]: handle to the call event loop; owns the one call
//!   attempt and is the only writer of its [`CallState`](callcore::CallState)
//! - [`negotiation`]: offer/answer ordering and remote ICE buffering on top
//!   of a [`PeerSession`]
//! - [`media`]: local audio track, mute and speaker routing, plus the
//!   webrtc-rs backed [`PeerSession`]
//! - [`transport`]: the outbound half of the chat relay as seen by calls
//!
//! # Signal flow
//!
//! A user action or inbound signal becomes a command on the manager's
//! queue. The manager transitions state and hands session work to a
//! per-call worker, whose completions come back through the same queue.

mod error;
mod events;
mod manager;
pub mod media;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod negotiation;
pub mod transport;

pub use error::CallError;
pub use events::{CallEvent, CallSnapshot, CallStateChanged};
pub use manager::CallManager;
pub use negotiation::{
    NegotiationError, PeerEvent, PeerEventSink, PeerSession, PeerSessionFactory, TransportState,
};
pub use transport::{ChannelRelay, SignalTransport};

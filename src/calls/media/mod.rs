//! Local media for calls.
//!
//! - [`MediaTrackController`]: the call's single local audio track, mute and
//!   speaker routing
//! - [`WebRtcSessionFactory`]: webrtc-rs implementation of the peer session

mod track;
mod webrtc_session;

pub use track::{AudioRouter, LocalAudioTrack, LoggingAudioRouter, MediaTrackController};
pub use webrtc_session::{WebRtcAudioTrack, WebRtcPeerSession, WebRtcSessionFactory};

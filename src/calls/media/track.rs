//! Local audio track, mute and speaker routing.

use std::sync::Arc;

use log::{debug, info};

/// The call's outbound audio track.
pub trait LocalAudioTrack: Send + Sync {
    /// Gate transmission without tearing the track down.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Release the track and its source. Idempotent.
    fn stop(&self);
}

/// Switches system audio output between the loudspeaker and the default
/// route (earpiece or headset).
pub trait AudioRouter: Send + Sync {
    fn set_speaker(&self, enabled: bool);
}

/// Router for platforms without audio routing control.
#[derive(Debug, Default)]
pub struct LoggingAudioRouter;

impl AudioRouter for LoggingAudioRouter {
    fn set_speaker(&self, enabled: bool) {
        info!(
            "Audio output routed to {}",
            if enabled { "speaker" } else { "default device" }
        );
    }
}

/// Owns the one local track of the current call and the two local-only
/// flags. Neither flag is signalled to the peer.
pub struct MediaTrackController {
    track: Option<Arc<dyn LocalAudioTrack>>,
    muted: bool,
    speaker: bool,
    router: Arc<dyn AudioRouter>,
}

impl MediaTrackController {
    pub fn new(router: Arc<dyn AudioRouter>) -> Self {
        Self {
            track: None,
            muted: false,
            speaker: false,
            router,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_speaker(&self) -> bool {
        self.speaker
    }

    pub fn has_track(&self) -> bool {
        self.track.is_some()
    }

    /// Take ownership of the call's track, applying the current mute flag.
    pub fn attach(&mut self, track: Arc<dyn LocalAudioTrack>) {
        if let Some(previous) = self.track.take() {
            debug!("Replacing local audio track");
            previous.stop();
        }
        track.set_enabled(!self.muted);
        self.track = Some(track);
    }

    /// Returns the new mute flag.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(track) = &self.track {
            track.set_enabled(!self.muted);
        }
        debug!("Microphone {}", if self.muted { "muted" } else { "live" });
        self.muted
    }

    /// Returns the new speaker flag.
    pub fn toggle_speaker(&mut self) -> bool {
        self.speaker = !self.speaker;
        self.router.set_speaker(self.speaker);
        self.speaker
    }

    /// Stop the track (whether or not it ever reached a session) and reset
    /// both flags.
    pub fn release(&mut self) {
        if let Some(track) = self.track.take() {
            track.stop();
        }
        if self.speaker {
            self.router.set_speaker(false);
        }
        self.muted = false;
        self.speaker = false;
    }
}

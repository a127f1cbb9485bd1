//! Events published by the call manager.

use chrono::{DateTime, Utc};
use serde::Serialize;

use callcore::{CallSession, CallState};

#[derive(Debug, Clone, Serialize)]
pub struct CallStateChanged {
    pub previous: CallState,
    pub state: CallState,
    /// Session at the time of the change; `None` once back to idle.
    pub session: Option<CallSession>,
    /// Human readable cause, set when entering `Error`.
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    StateChanged(CallStateChanged),
    MuteChanged(bool),
    SpeakerChanged(bool),
}

impl CallEvent {
    /// New state, if this is a state change.
    pub fn state(&self) -> Option<CallState> {
        match self {
            Self::StateChanged(change) => Some(change.state),
            _ => None,
        }
    }
}

/// Point-in-time view of the call manager.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub session: Option<CallSession>,
    pub muted: bool,
    pub speaker: bool,
}

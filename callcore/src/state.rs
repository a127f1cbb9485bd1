//! Call state machine transition table.

use std::fmt;

use serde::Serialize;

/// Observable state of the (single) call.
///
/// `Idle` is the only durable state; the terminal states are published
/// briefly and then cleanup returns the machine to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing call: request sent, waiting for the peer to pick up.
    Calling,
    /// Incoming call: ringing locally.
    Incoming,
    /// Accepted, session negotiation in progress.
    Connecting,
    /// Transport connected, audio flowing.
    Connected,
    Ended,
    Rejected,
    Error,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling | Self::Incoming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Error)
    }

    /// A call attempt is live: neither idle nor finished.
    pub fn is_live(&self) -> bool {
        !self.is_idle() && !self.is_terminal()
    }

    /// Compute the state that `transition` leads to.
    pub fn next(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState::*;
        use CallTransition::*;

        let next = match (self, transition) {
            (_, Reset) => Idle,
            (Idle, LocalStart) => Calling,
            (Idle, RemoteRequest) => Incoming,
            (Incoming, LocalAccept) => Connecting,
            (Calling, RemoteAccept) => Connecting,
            (Connecting, TransportConnected) => Connected,
            (Incoming, LocalReject) => Rejected,
            (Calling | Incoming | Connecting, RemoteReject) => Rejected,
            (Calling | Incoming | Connecting | Connected, Hangup) => Ended,
            (Calling | Incoming | Connecting | Connected, NegotiationFailed) => Error,
            (from, attempted) => return Err(InvalidTransition { from, attempted }),
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    LocalStart,
    RemoteRequest,
    LocalAccept,
    RemoteAccept,
    TransportConnected,
    LocalReject,
    RemoteReject,
    Hangup,
    NegotiationFailed,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: CallState,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {:?}",
            self.attempted, self.from
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [CallState; 8] = [
        CallState::Idle,
        CallState::Calling,
        CallState::Incoming,
        CallState::Connecting,
        CallState::Connected,
        CallState::Ended,
        CallState::Rejected,
        CallState::Error,
    ];

    const ALL_TRANSITIONS: [CallTransition; 10] = [
        CallTransition::LocalStart,
        CallTransition::RemoteRequest,
        CallTransition::LocalAccept,
        CallTransition::RemoteAccept,
        CallTransition::TransportConnected,
        CallTransition::LocalReject,
        CallTransition::RemoteReject,
        CallTransition::Hangup,
        CallTransition::NegotiationFailed,
        CallTransition::Reset,
    ];

    fn drive(transitions: &[CallTransition]) -> CallState {
        transitions
            .iter()
            .try_fold(CallState::Idle, |s, t| s.next(*t))
            .unwrap()
    }

    /// Flow: Idle → Calling → Connecting → Connected → Ended → Idle
    #[test]
    fn test_outgoing_call_flow() {
        use CallTransition::*;
        assert_eq!(drive(&[LocalStart]), CallState::Calling);
        assert_eq!(drive(&[LocalStart, RemoteAccept]), CallState::Connecting);
        assert_eq!(
            drive(&[LocalStart, RemoteAccept, TransportConnected]),
            CallState::Connected
        );
        assert_eq!(
            drive(&[LocalStart, RemoteAccept, TransportConnected, Hangup]),
            CallState::Ended
        );
        assert_eq!(
            drive(&[LocalStart, RemoteAccept, TransportConnected, Hangup, Reset]),
            CallState::Idle
        );
    }

    /// Flow: Idle → Incoming → Connecting → Connected
    #[test]
    fn test_incoming_call_flow() {
        use CallTransition::*;
        assert_eq!(
            drive(&[RemoteRequest, LocalAccept, TransportConnected]),
            CallState::Connected
        );
    }

    #[test]
    fn test_rejections() {
        use CallTransition::*;
        assert_eq!(drive(&[RemoteRequest, LocalReject]), CallState::Rejected);
        assert_eq!(drive(&[LocalStart, RemoteReject]), CallState::Rejected);
        assert!(CallState::Calling.next(LocalReject).is_err());
        assert_eq!(
            drive(&[RemoteRequest, LocalAccept, RemoteReject]),
            CallState::Rejected
        );
        assert!(CallState::Connected.next(RemoteReject).is_err());
    }

    #[test]
    fn test_connected_only_reachable_from_connecting() {
        for state in ALL_STATES {
            for transition in ALL_TRANSITIONS {
                if let Ok(CallState::Connected) = state.next(transition) {
                    assert_eq!(state, CallState::Connecting);
                }
            }
        }
    }

    #[test]
    fn test_negotiation_failure_from_any_live_state() {
        for state in ALL_STATES {
            let result = state.next(CallTransition::NegotiationFailed);
            if state.is_live() {
                assert_eq!(result, Ok(CallState::Error));
            } else {
                assert!(result.is_err());
            }
        }
    }

    #[test]
    fn test_terminal_states_only_reset() {
        for state in [CallState::Ended, CallState::Rejected, CallState::Error] {
            for transition in ALL_TRANSITIONS {
                let result = state.next(transition);
                if transition == CallTransition::Reset {
                    assert_eq!(result, Ok(CallState::Idle));
                } else {
                    assert!(result.is_err(), "{:?} accepted {:?}", state, transition);
                }
            }
        }
    }

    #[test]
    fn test_start_only_from_idle() {
        for state in ALL_STATES {
            let result = state.next(CallTransition::LocalStart);
            assert_eq!(result.is_ok(), state == CallState::Idle);
        }
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = CallState::Idle.next(CallTransition::LocalAccept).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid transition LocalAccept in state Idle"
        );
    }
}

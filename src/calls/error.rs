//! Call-related error types.

use callcore::{CallState, InvalidTransition};
use thiserror::Error;

/// Rejection of a local call action.
///
/// Failures that happen during a call are reported as state events instead.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress (state: {0})")]
    Busy(CallState),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call manager has shut down")]
    Shutdown,
}

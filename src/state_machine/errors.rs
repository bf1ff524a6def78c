use thiserror::Error;

/// Error types for state machine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Cannot transition from terminal state {state}")]
    TerminalState { state: String },
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;

/// Helper function to create guard failures
pub fn guard_failed(reason: impl Into<String>) -> StateMachineError {
    StateMachineError::GuardFailed {
        reason: reason.into(),
    }
}

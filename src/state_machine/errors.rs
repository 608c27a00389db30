use thiserror::Error;

/// Errors raised by the run state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Run already terminal in state {state}; event {event} ignored")]
    AlreadyTerminal { state: String, event: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::models::InputError;
use crate::orchestration::{LaunchError, ManifestError, ProbeError};
use crate::state_machine::StateMachineError;

/// Why a run ended in `Failed`, as reported by `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The manifest could not be read; nothing was dispatched past the failure
    ManifestUnreadable,
    /// The destination is in a different region than the deployment
    WrongRegion,
    /// The probe failed in a way that is neither a redirect nor a denial
    Unclassified,
    /// More batches failed than the tolerated percentage allows
    ToleratedFailureExceeded,
    /// The overall deadline elapsed before the run finished
    DeadlineExceeded,
    /// The run was cancelled by an operator
    Cancelled,
    /// The execution input was rejected before probing
    InvalidInput,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManifestUnreadable => write!(f, "manifest_unreadable"),
            Self::WrongRegion => write!(f, "wrong_region"),
            Self::Unclassified => write!(f, "unclassified"),
            Self::ToleratedFailureExceeded => write!(f, "tolerated_failure_exceeded"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InvalidInput => write!(f, "invalid_input"),
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum CopyOutError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InputError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Worker launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} already reached a terminal state")]
    RunAlreadyTerminal(String),

    #[error("Run {0} is still executing")]
    RunStillActive(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CopyOutError {
    /// Terminal error kind this error maps to when it ends a run
    pub fn run_error_kind(&self) -> RunErrorKind {
        match self {
            Self::InvalidInput(_) => RunErrorKind::InvalidInput,
            Self::Probe(ProbeError::WrongRegion { .. }) => RunErrorKind::WrongRegion,
            Self::Manifest(_) => RunErrorKind::ManifestUnreadable,
            _ => RunErrorKind::Unclassified,
        }
    }
}

pub type Result<T> = std::result::Result<T, CopyOutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&RunErrorKind::ToleratedFailureExceeded).unwrap();
        assert_eq!(json, "\"tolerated_failure_exceeded\"");
        assert_eq!(RunErrorKind::WrongRegion.to_string(), "wrong_region");
    }

    #[test]
    fn test_copy_out_error_maps_to_run_error_kind() {
        let err: CopyOutError = ProbeError::WrongRegion {
            destination: "target".to_string(),
            message: "redirect".to_string(),
        }
        .into();
        assert_eq!(err.run_error_kind(), RunErrorKind::WrongRegion);

        let err: CopyOutError = InputError::InvalidBatchSize(0).into();
        assert_eq!(err.run_error_kind(), RunErrorKind::InvalidInput);
    }
}

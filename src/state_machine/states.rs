use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RunErrorKind;

/// Lifecycle of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum RunState {
    /// Accepted, not yet started
    Pending,
    /// Checking that the destination is writable
    Probing,
    /// Batches are being executed
    Dispatching,
    /// All batches attempted within the tolerated failure share
    Succeeded,
    /// Terminal failure with its cause
    Failed(RunErrorKind),
}

impl RunState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    /// Check if the run is doing work
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Probing | Self::Dispatching)
    }

    pub fn error_kind(&self) -> Option<RunErrorKind> {
        match self {
            Self::Failed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Probing => write!(f, "probing"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal_check() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed(RunErrorKind::WrongRegion).is_terminal());
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Probing.is_terminal());
        assert!(!RunState::Dispatching.is_terminal());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(RunState::Dispatching.to_string(), "dispatching");
        assert_eq!(
            RunState::Failed(RunErrorKind::DeadlineExceeded).to_string(),
            "failed(deadline_exceeded)"
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&RunState::Failed(RunErrorKind::Cancelled)).unwrap();
        assert_eq!(json, r#"{"state":"failed","error":"cancelled"}"#);

        let parsed: RunState = serde_json::from_str(r#"{"state":"probing"}"#).unwrap();
        assert_eq!(parsed, RunState::Probing);
    }
}

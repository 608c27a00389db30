use serde::{Deserialize, Serialize};

use crate::error::RunErrorKind;

/// Events that can trigger run state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    /// Begin probing the destination
    Start,
    /// The probe was denied; wait and probe again
    AccessDenied,
    /// The destination accepted the marker write
    Writable,
    /// Every batch was attempted within the tolerated failure share
    Complete,
    /// End the run with the given cause
    Fail(RunErrorKind),
}

impl RunEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AccessDenied => "access_denied",
            Self::Writable => "writable",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_))
    }
}

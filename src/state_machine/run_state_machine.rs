use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::RunEvent;
use super::states::RunState;

/// One applied transition, kept for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub event: RunEvent,
    pub at: DateTime<Utc>,
}

/// State machine for a single run
///
/// Owned exclusively by the workflow controller's run task. Once a terminal
/// state is reached every further event is rejected, so a run can only end once.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    run_id: Uuid,
    current: RunState,
    history: Vec<StateTransition>,
}

impl RunStateMachine {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            current: RunState::default(),
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Apply an event, returning the new state
    pub fn transition(&mut self, event: RunEvent) -> StateMachineResult<RunState> {
        let target = Self::determine_target_state(self.current, event)?;

        debug!(
            run_id = %self.run_id,
            from = %self.current,
            to = %target,
            event = event.event_type(),
            "Run state transition"
        );

        self.history.push(StateTransition {
            from: self.current,
            to: target,
            event,
            at: Utc::now(),
        });
        self.current = target;
        Ok(target)
    }

    fn determine_target_state(current: RunState, event: RunEvent) -> StateMachineResult<RunState> {
        if current.is_terminal() {
            return Err(StateMachineError::AlreadyTerminal {
                state: current.to_string(),
                event: event.event_type().to_string(),
            });
        }

        let target = match (current, event) {
            (RunState::Pending, RunEvent::Start) => RunState::Probing,

            // Denied probes loop until writable or failed
            (RunState::Probing, RunEvent::AccessDenied) => RunState::Probing,
            (RunState::Probing, RunEvent::Writable) => RunState::Dispatching,

            (RunState::Dispatching, RunEvent::Complete) => RunState::Succeeded,

            // Deadline, cancellation and fatal errors end the run from any live phase
            (_, RunEvent::Fail(kind)) => RunState::Failed(kind),

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunErrorKind;

    #[test]
    fn test_happy_path() {
        let mut sm = RunStateMachine::new(Uuid::new_v4());
        assert_eq!(sm.transition(RunEvent::Start).unwrap(), RunState::Probing);
        assert_eq!(sm.transition(RunEvent::AccessDenied).unwrap(), RunState::Probing);
        assert_eq!(sm.transition(RunEvent::Writable).unwrap(), RunState::Dispatching);
        assert_eq!(sm.transition(RunEvent::Complete).unwrap(), RunState::Succeeded);
        assert_eq!(sm.history().len(), 4);
    }

    #[test]
    fn test_terminal_state_reached_at_most_once() {
        let mut sm = RunStateMachine::new(Uuid::new_v4());
        sm.transition(RunEvent::Start).unwrap();
        sm.transition(RunEvent::Fail(RunErrorKind::WrongRegion)).unwrap();

        let err = sm
            .transition(RunEvent::Fail(RunErrorKind::DeadlineExceeded))
            .unwrap_err();
        assert!(matches!(err, StateMachineError::AlreadyTerminal { .. }));
        assert_eq!(
            sm.current_state(),
            RunState::Failed(RunErrorKind::WrongRegion)
        );
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut sm = RunStateMachine::new(Uuid::new_v4());
        assert!(matches!(
            sm.transition(RunEvent::Writable),
            Err(StateMachineError::InvalidTransition { .. })
        ));
        sm.transition(RunEvent::Start).unwrap();
        assert!(sm.transition(RunEvent::Complete).is_err());
        assert_eq!(sm.current_state(), RunState::Probing);
    }

    #[test]
    fn test_fail_from_pending() {
        let mut sm = RunStateMachine::new(Uuid::new_v4());
        assert_eq!(
            sm.transition(RunEvent::Fail(RunErrorKind::InvalidInput)).unwrap(),
            RunState::Failed(RunErrorKind::InvalidInput)
        );
    }
}

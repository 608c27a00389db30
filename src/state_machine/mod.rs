// Run lifecycle state machine
//
// Pending -> Probing (self-loop on access denied) -> Dispatching -> Succeeded,
// with Failed reachable from every live state.

pub mod errors;
pub mod events;
pub mod run_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::RunEvent;
pub use run_state_machine::{RunStateMachine, StateTransition};
pub use states::RunState;

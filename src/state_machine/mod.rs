// State machines for the job and unit lifecycles.
//
// Both machines are pure transition tables with guards; persistence is a
// compare-and-set performed by the state store against the source state.

pub mod errors;
pub mod events;
pub mod guards;
pub mod job_state_machine;
pub mod states;
pub mod unit_state_machine;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{JobEvent, UnitEvent};
pub use guards::TransitionGuard;
pub use job_state_machine::JobStateMachine;
pub use states::{JobState, UnitState};
pub use unit_state_machine::UnitStateMachine;

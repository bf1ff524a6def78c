use super::errors::{StateMachineError, StateMachineResult};
use super::events::UnitEvent;
use super::guards::TransitionGuard;
use super::states::UnitState;
use crate::models::Unit;

/// Transition table for a single unit, bounded by the attempt budget
#[derive(Debug, Clone, Copy)]
pub struct UnitStateMachine {
    current_state: UnitState,
    attempt_count: u32,
    max_attempts: u32,
}

impl UnitStateMachine {
    pub fn new(current_state: UnitState, attempt_count: u32, max_attempts: u32) -> Self {
        Self {
            current_state,
            attempt_count,
            max_attempts,
        }
    }

    pub fn for_unit(unit: &Unit, max_attempts: u32) -> Self {
        Self::new(unit.status, unit.attempt_count, max_attempts)
    }

    pub fn current_state(&self) -> UnitState {
        self.current_state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt may start after the current one fails
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Validate and apply `event`. A claim consumes one attempt.
    pub fn transition(&mut self, event: &UnitEvent) -> StateMachineResult<UnitState> {
        let target = Self::determine_target_state(self.current_state, event)?;
        TransitionGuard::can_transition_unit(
            self.current_state,
            target,
            event,
            self.attempt_count,
            self.max_attempts,
        )?;

        if matches!(event, UnitEvent::Claim) {
            self.attempt_count += 1;
        }
        self.current_state = target;
        Ok(target)
    }

    pub fn determine_target_state(
        current_state: UnitState,
        event: &UnitEvent,
    ) -> StateMachineResult<UnitState> {
        use UnitEvent::*;
        use UnitState::*;

        if current_state.is_terminal() {
            return Err(StateMachineError::TerminalState {
                state: current_state.to_string(),
            });
        }

        let target = match (current_state, event) {
            (Pending, Claim) => Processing,
            (Processing, Succeed(_)) => Completed,
            (Processing, Retry) => Pending,
            (Processing, Fail(_)) => Failed,
            (Pending, Abandon(_)) => Failed,
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Event to apply after a failed attempt: retry while attempts remain
    /// (and the job is still live), otherwise fail permanently
    pub fn failure_event(&self, error: impl Into<String>, job_cancelled: bool) -> UnitEvent {
        if self.has_attempts_remaining() && !job_cancelled {
            UnitEvent::Retry
        } else {
            UnitEvent::Fail(error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_then_succeed_counts_two_attempts() {
        let mut sm = UnitStateMachine::new(UnitState::Pending, 0, 3);
        sm.transition(&UnitEvent::Claim).unwrap();
        assert_eq!(sm.failure_event("boom", false), UnitEvent::Retry);
        sm.transition(&UnitEvent::Retry).unwrap();
        sm.transition(&UnitEvent::Claim).unwrap();
        assert_eq!(
            sm.transition(&UnitEvent::Succeed("out.pdf".into())).unwrap(),
            UnitState::Completed
        );
        assert_eq!(sm.attempt_count(), 2);
    }

    #[test]
    fn test_exhausted_attempts_fail_permanently() {
        let mut sm = UnitStateMachine::new(UnitState::Pending, 0, 2);
        for _ in 0..2 {
            sm.transition(&UnitEvent::Claim).unwrap();
            if let UnitEvent::Retry = sm.failure_event("corrupt file", false) {
                sm.transition(&UnitEvent::Retry).unwrap();
            }
        }
        let event = sm.failure_event("corrupt file", false);
        assert_eq!(event, UnitEvent::Fail("corrupt file".into()));
        assert_eq!(sm.transition(&event).unwrap(), UnitState::Failed);
        assert_eq!(sm.attempt_count(), 2);
    }

    #[test]
    fn test_claim_beyond_budget_is_rejected() {
        let mut sm = UnitStateMachine::new(UnitState::Pending, 3, 3);
        assert!(sm.transition(&UnitEvent::Claim).is_err());
        assert_eq!(sm.attempt_count(), 3);
    }

    #[test]
    fn test_cancelled_job_does_not_retry() {
        let mut sm = UnitStateMachine::new(UnitState::Pending, 0, 5);
        sm.transition(&UnitEvent::Claim).unwrap();
        assert!(matches!(
            sm.failure_event("engine crash", true),
            UnitEvent::Fail(_)
        ));
    }

    #[test]
    fn test_single_terminal_transition() {
        let mut sm = UnitStateMachine::new(UnitState::Processing, 1, 3);
        sm.transition(&UnitEvent::Succeed("a.pdf".into())).unwrap();
        let err = sm.transition(&UnitEvent::Fail("late".into())).unwrap_err();
        assert!(matches!(err, StateMachineError::TerminalState { .. }));
    }
}

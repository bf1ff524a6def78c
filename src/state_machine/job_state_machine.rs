use super::errors::{StateMachineError, StateMachineResult};
use super::events::JobEvent;
use super::guards::TransitionGuard;
use super::states::JobState;

/// Pure transition table for the job lifecycle.
///
/// The machine holds no I/O. Callers persist the returned target state with a
/// compare-and-set on the current state, so concurrent writers cannot both
/// apply a transition from the same source state.
#[derive(Debug, Clone, Copy)]
pub struct JobStateMachine {
    current_state: JobState,
}

impl JobStateMachine {
    pub fn new(current_state: JobState) -> Self {
        Self { current_state }
    }

    pub fn current_state(&self) -> JobState {
        self.current_state
    }

    /// Validate and apply `event`, returning the new state
    pub fn transition(&mut self, event: &JobEvent) -> StateMachineResult<JobState> {
        let target = Self::determine_target_state(self.current_state, event)?;
        TransitionGuard::can_transition_job(self.current_state, target, event)?;
        self.current_state = target;
        Ok(target)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: JobState,
        event: &JobEvent,
    ) -> StateMachineResult<JobState> {
        use JobEvent::*;
        use JobState::*;

        if current_state.is_terminal() {
            return Err(StateMachineError::TerminalState {
                state: current_state.to_string(),
            });
        }

        let target = match (current_state, event) {
            (Pending, StartExpansion) => Expanding,
            (Expanding, ExpansionFailed(_)) => Failed,
            (Expanding, UnitsExpanded(_)) => InProgress,
            (InProgress, AllUnitsTerminal { total, failed, .. }) => {
                Self::terminal_status(*total, *failed)
            }
            (InProgress, PackagingFailed(_) | FinalizationFailed(_)) => Failed,
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Terminal status for a drained job.
    ///
    /// `failed == 0` is COMPLETED, `failed == total` is FAILED, anything between
    /// is COMPLETED_WITH_ERRORS.
    pub fn terminal_status(total: u32, failed: u32) -> JobState {
        if failed == 0 {
            JobState::Completed
        } else if failed >= total {
            JobState::Failed
        } else {
            JobState::CompletedWithErrors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained(total: u32, completed: u32, failed: u32) -> JobEvent {
        JobEvent::AllUnitsTerminal {
            total,
            completed,
            failed,
        }
    }

    #[test]
    fn test_happy_path_walks_all_states() {
        let mut sm = JobStateMachine::new(JobState::Pending);
        assert_eq!(
            sm.transition(&JobEvent::StartExpansion).unwrap(),
            JobState::Expanding
        );
        assert_eq!(
            sm.transition(&JobEvent::UnitsExpanded(3)).unwrap(),
            JobState::InProgress
        );
        assert_eq!(
            sm.transition(&drained(3, 3, 0)).unwrap(),
            JobState::Completed
        );
        assert!(sm.transition(&drained(3, 3, 0)).is_err());
    }

    #[test]
    fn test_terminal_status_table() {
        assert_eq!(JobStateMachine::terminal_status(3, 0), JobState::Completed);
        assert_eq!(
            JobStateMachine::terminal_status(3, 1),
            JobState::CompletedWithErrors
        );
        assert_eq!(
            JobStateMachine::terminal_status(3, 2),
            JobState::CompletedWithErrors
        );
        assert_eq!(JobStateMachine::terminal_status(3, 3), JobState::Failed);
    }

    #[test]
    fn test_expansion_failure_is_terminal() {
        let mut sm = JobStateMachine::new(JobState::Pending);
        sm.transition(&JobEvent::StartExpansion).unwrap();
        assert_eq!(
            sm.transition(&JobEvent::ExpansionFailed("empty batch".into()))
                .unwrap(),
            JobState::Failed
        );
        assert!(sm.current_state().is_terminal());
    }

    #[test]
    fn test_status_never_reverts() {
        let mut sm = JobStateMachine::new(JobState::InProgress);
        let err = sm.transition(&JobEvent::StartExpansion).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.current_state(), JobState::InProgress);
    }

    #[test]
    fn test_packaging_failure_fails_job() {
        let target = JobStateMachine::determine_target_state(
            JobState::InProgress,
            &JobEvent::PackagingFailed("no space left on device".into()),
        )
        .unwrap();
        assert_eq!(target, JobState::Failed);
    }

    #[test]
    fn test_finalization_failure_fails_job() {
        let mut sm = JobStateMachine::new(JobState::InProgress);
        let target = sm
            .transition(&JobEvent::FinalizationFailed("outputs missing".into()))
            .unwrap();
        assert_eq!(target, JobState::Failed);

        let err = JobStateMachine::determine_target_state(
            JobState::Expanding,
            &JobEvent::FinalizationFailed("outputs missing".into()),
        )
        .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_undrained_barrier_cannot_finalize() {
        let mut sm = JobStateMachine::new(JobState::InProgress);
        assert!(sm.transition(&drained(3, 2, 0)).is_err());
        assert_eq!(sm.current_state(), JobState::InProgress);
    }
}

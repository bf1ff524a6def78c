use super::errors::{guard_failed, StateMachineError, StateMachineResult};
use super::events::{JobEvent, UnitEvent};
use super::states::{JobState, UnitState};

/// Guard conditions for job and unit state transitions
#[derive(Debug)]
pub struct TransitionGuard;

impl TransitionGuard {
    /// Check if a job transition is valid
    pub fn can_transition_job(
        from: JobState,
        to: JobState,
        event: &JobEvent,
    ) -> StateMachineResult<()> {
        use JobEvent::*;
        use JobState::*;

        if from.is_terminal() {
            return Err(StateMachineError::TerminalState {
                state: from.to_string(),
            });
        }

        let valid = match (from, to, event) {
            (Pending, Expanding, StartExpansion) => true,

            (Expanding, Failed, ExpansionFailed(_)) => true,
            (Expanding, InProgress, UnitsExpanded(total)) => {
                if *total == 0 {
                    return Err(guard_failed(
                        "A batch with zero units is an expansion failure",
                    ));
                }
                true
            }

            (
                InProgress,
                Completed | CompletedWithErrors | Failed,
                AllUnitsTerminal {
                    total,
                    completed,
                    failed,
                },
            ) => {
                if completed + failed != *total {
                    return Err(guard_failed(format!(
                        "Units still outstanding: completed {completed} + failed {failed} != total {total}"
                    )));
                }
                true
            }
            (InProgress, Failed, PackagingFailed(_) | FinalizationFailed(_)) => true,

            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(guard_failed(format!(
                "Invalid job transition from {from} to {to} with event {}",
                event.event_type()
            )))
        }
    }

    /// Check if a unit transition is valid
    pub fn can_transition_unit(
        from: UnitState,
        to: UnitState,
        event: &UnitEvent,
        attempt_count: u32,
        max_attempts: u32,
    ) -> StateMachineResult<()> {
        use UnitEvent::*;
        use UnitState::*;

        if from.is_terminal() {
            return Err(StateMachineError::TerminalState {
                state: from.to_string(),
            });
        }

        let valid = match (from, to, event) {
            (UnitState::Pending, Processing, Claim) => {
                if attempt_count >= max_attempts {
                    return Err(guard_failed(format!(
                        "Unit already used {attempt_count} of {max_attempts} attempts"
                    )));
                }
                true
            }
            (Processing, Completed, Succeed(_)) => true,
            (Processing, UnitState::Pending, Retry) => {
                if attempt_count >= max_attempts {
                    return Err(guard_failed(format!(
                        "Retry requested after final attempt {attempt_count} of {max_attempts}"
                    )));
                }
                true
            }
            (Processing, Failed, Fail(_)) => true,
            (UnitState::Pending, Failed, Abandon(_)) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(guard_failed(format!(
                "Invalid unit transition from {from} to {to} with event {}",
                event.event_type()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_job_rejects_everything() {
        let result = TransitionGuard::can_transition_job(
            JobState::Completed,
            JobState::Failed,
            &JobEvent::PackagingFailed("disk full".into()),
        );
        assert!(matches!(
            result,
            Err(StateMachineError::TerminalState { .. })
        ));
    }

    #[test]
    fn test_zero_unit_expansion_is_rejected() {
        let result = TransitionGuard::can_transition_job(
            JobState::Expanding,
            JobState::InProgress,
            &JobEvent::UnitsExpanded(0),
        );
        assert!(matches!(result, Err(StateMachineError::GuardFailed { .. })));
    }

    #[test]
    fn test_finalization_requires_drained_counts() {
        let event = JobEvent::AllUnitsTerminal {
            total: 3,
            completed: 1,
            failed: 1,
        };
        assert!(
            TransitionGuard::can_transition_job(JobState::InProgress, JobState::Completed, &event)
                .is_err()
        );
    }

    #[test]
    fn test_claim_respects_attempt_budget() {
        assert!(TransitionGuard::can_transition_unit(
            UnitState::Pending,
            UnitState::Processing,
            &UnitEvent::Claim,
            2,
            3
        )
        .is_ok());
        assert!(TransitionGuard::can_transition_unit(
            UnitState::Pending,
            UnitState::Processing,
            &UnitEvent::Claim,
            3,
            3
        )
        .is_err());
    }

    #[test]
    fn test_processing_unit_cannot_be_abandoned() {
        let result = TransitionGuard::can_transition_unit(
            UnitState::Processing,
            UnitState::Failed,
            &UnitEvent::Abandon("cancelled".into()),
            1,
            3,
        );
        assert!(result.is_err());
    }
}

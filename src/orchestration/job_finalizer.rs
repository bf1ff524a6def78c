//! # Job Finalizer
//!
//! Fan-in callback that closes out a job once every unit is terminal.
//!
//! ## Overview
//!
//! The finalizer runs in the worker whose barrier notification observed
//! [`BarrierSignal::Released`]. It re-reads the job counters, verifies the job
//! is drained, computes the terminal status from the job state machine,
//! packages the completed outputs and writes the terminal status with a
//! compare-and-set from `IN_PROGRESS`.
//!
//! Records that cannot be finalized as they stand (completed units without a
//! recorded output) fail the job rather than leaving it `IN_PROGRESS` for the
//! recovery sweep to retry forever.
//!
//! ## Idempotence
//!
//! A second invocation on a terminal job returns
//! [`FinalizationAction::AlreadyFinalized`] and writes nothing, so
//! `finalized_at` and the status keep the values of the first run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::SystemContext;
use crate::barrier::BarrierSignal;
use crate::error::{BatchError, Result};
use crate::events::LifecycleEvent;
use crate::logging::{log_error, log_job_operation};
use crate::models::{JobCompletion, JobCounts};
use crate::services::OutputRef;
use crate::state_machine::{JobEvent, JobState, JobStateMachine, StateMachineError, UnitState};
use crate::store::StoreError;

/// Result of a finalization call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationResult {
    pub job_id: Uuid,
    pub action: FinalizationAction,
    pub counts: JobCounts,
    pub archive_ref: Option<String>,
}

/// Type of finalization action taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizationAction {
    /// Every unit completed
    Completed,
    /// Some units failed, the rest completed
    CompletedWithErrors,
    /// Every unit failed, or packaging failed
    Failed,
    /// The job was already terminal; nothing was written
    AlreadyFinalized,
}

impl FinalizationAction {
    fn for_status(status: JobState) -> Self {
        match status {
            JobState::Completed => Self::Completed,
            JobState::CompletedWithErrors => Self::CompletedWithErrors,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum FinalizationError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot be finalized from {state}")]
    InvalidState { job_id: Uuid, state: JobState },

    #[error("Job {job_id} finalized with outstanding units ({counts:?})")]
    Undrained { job_id: Uuid, counts: JobCounts },

    #[error("Job {job_id} counts {expected} completed units but {found} outputs are recorded")]
    OutputMismatch {
        job_id: Uuid,
        expected: u32,
        found: usize,
    },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl FinalizationError {
    /// Everything except storage failures is a broken fan-in contract
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// JobFinalizer runs the single fan-in step of a job
#[derive(Debug, Clone)]
pub struct JobFinalizer {
    context: SystemContext,
}

impl JobFinalizer {
    pub fn new(context: SystemContext) -> Self {
        Self { context }
    }

    /// Deliver a unit's barrier notification and, when it drains the barrier,
    /// finalize the job inline.
    ///
    /// Must be called exactly once per unit terminal transition, after the
    /// transition has been written.
    pub async fn handle_unit_terminal(
        &self,
        job_id: Uuid,
        unit_id: Uuid,
    ) -> Result<Option<FinalizationResult>> {
        let signal = match self.context.barrier.notify(job_id, unit_id).await {
            Ok(signal) => signal,
            Err(err) => {
                if err.is_contract_violation() {
                    log_error(
                        "job_finalizer",
                        "barrier_notify",
                        &err.to_string(),
                        Some(&format!("job_id={job_id} unit_id={unit_id}")),
                    );
                }
                return Err(BatchError::Barrier(err));
            }
        };

        match signal {
            BarrierSignal::Pending { outstanding } => {
                debug!(job_id = %job_id, unit_id = %unit_id, outstanding, "Barrier notified");
                Ok(None)
            }
            BarrierSignal::Released => {
                info!(job_id = %job_id, unit_id = %unit_id, "Barrier released, finalizing job");
                let result = self.finalize(job_id).await.map_err(|err| {
                    if err.is_contract_violation() {
                        log_error(
                            "job_finalizer",
                            "finalize",
                            &err.to_string(),
                            Some(&format!("job_id={job_id}")),
                        );
                    }
                    BatchError::Finalization(err)
                })?;
                Ok(Some(result))
            }
        }
    }

    /// Finalize `job_id`. Safe to call more than once.
    pub async fn finalize(
        &self,
        job_id: Uuid,
    ) -> std::result::Result<FinalizationResult, FinalizationError> {
        let store = &self.context.store;
        let job = store
            .get_job(job_id)
            .await?
            .ok_or(FinalizationError::JobNotFound(job_id))?;

        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already finalized");
            return Ok(FinalizationResult {
                job_id,
                action: FinalizationAction::AlreadyFinalized,
                counts: job.counts(),
                archive_ref: job.archive_ref,
            });
        }

        if job.status != JobState::InProgress {
            return Err(FinalizationError::InvalidState {
                job_id,
                state: job.status,
            });
        }

        let counts = job.counts();
        if !counts.is_drained() {
            return Err(FinalizationError::Undrained { job_id, counts });
        }

        let mut status = JobStateMachine::new(job.status).transition(&JobEvent::AllUnitsTerminal {
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
        })?;

        let mut error = if status == JobState::Failed {
            Some(format!("all {} units failed", counts.total))
        } else {
            None
        };
        let mut archive_ref = None;

        if counts.completed > 0 {
            match self.completed_outputs(job_id, counts).await {
                Ok(outputs) => match self.context.packager.package(job_id, &outputs).await {
                    Ok(archive) => archive_ref = Some(archive),
                    Err(err) => {
                        let message = format!("packaging failed: {err}");
                        warn!(job_id = %job_id, error = %err, "Packaging failed, failing job");
                        status = JobStateMachine::determine_target_state(
                            JobState::InProgress,
                            &JobEvent::PackagingFailed(message.clone()),
                        )?;
                        error = Some(message);
                    }
                },
                // Finalizing again would hit the same records; fail the job instead.
                Err(err @ FinalizationError::OutputMismatch { .. }) => {
                    let message = err.to_string();
                    log_error(
                        "job_finalizer",
                        "collect_outputs",
                        &message,
                        Some(&format!("job_id={job_id}")),
                    );
                    status = JobStateMachine::determine_target_state(
                        JobState::InProgress,
                        &JobEvent::FinalizationFailed(message.clone()),
                    )?;
                    error = Some(message);
                }
                Err(err) => return Err(err),
            }
        }

        let completion = JobCompletion {
            status,
            error,
            archive_ref: archive_ref.clone(),
            finalized_at: Utc::now(),
        };

        if !store
            .complete_job(job_id, JobState::InProgress, &completion)
            .await?
        {
            warn!(job_id = %job_id, "Job left IN_PROGRESS before finalization was written");
            let current = store
                .get_job(job_id)
                .await?
                .ok_or(FinalizationError::JobNotFound(job_id))?;
            return Ok(FinalizationResult {
                job_id,
                action: FinalizationAction::AlreadyFinalized,
                counts: current.counts(),
                archive_ref: current.archive_ref,
            });
        }

        if let Err(err) = self.context.barrier.retire(job_id).await {
            error!(job_id = %job_id, error = %err, "Failed to retire completion barrier");
        }

        self.context.events.publish(LifecycleEvent::JobFinalized {
            job_id,
            status,
            completed_units: counts.completed,
            failed_units: counts.failed,
            archive_ref: archive_ref.clone(),
        });
        log_job_operation(
            "finalize",
            job_id,
            status.as_str(),
            Some(&format!(
                "completed={} failed={} total={}",
                counts.completed, counts.failed, counts.total
            )),
        );

        Ok(FinalizationResult {
            job_id,
            action: FinalizationAction::for_status(status),
            counts,
            archive_ref,
        })
    }

    async fn completed_outputs(
        &self,
        job_id: Uuid,
        counts: JobCounts,
    ) -> std::result::Result<Vec<OutputRef>, FinalizationError> {
        let outputs: Vec<OutputRef> = self
            .context
            .store
            .list_units(job_id)
            .await?
            .into_iter()
            .filter(|unit| unit.status == UnitState::Completed)
            .filter_map(|unit| unit.output_ref)
            .collect();

        if outputs.len() != counts.completed as usize {
            return Err(FinalizationError::OutputMismatch {
                job_id,
                expected: counts.completed,
                found: outputs.len(),
            });
        }
        Ok(outputs)
    }
}

//! # Unit Executor
//!
//! Processes one [`UnitDispatch`]: claim, convert, record, notify.
//!
//! ## Flow
//!
//! 1. A pending unit of a cancelled job is abandoned as `FAILED` without
//!    starting an attempt, and still notifies the barrier.
//! 2. The unit is claimed with a compare-and-set on `PENDING`. Losing the
//!    claim means another dispatch owns the unit, so this one is dropped.
//! 3. The converter runs under the conversion timeout with panics caught.
//! 4. Success writes `COMPLETED` and the job counter together, then notifies.
//! 5. Failure either releases the unit for a delayed retry (no notification)
//!    or writes `FAILED` and notifies.
//!
//! A notification that drains the barrier runs the job finalizer inline.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::context::SystemContext;
use super::job_finalizer::JobFinalizer;
use super::types::UnitDispatch;
use super::worker_pool::DispatchHandle;
use crate::error::{BatchError, Result};
use crate::events::LifecycleEvent;
use crate::logging::log_unit_operation;
use crate::models::{Unit, UnitOutcome};
use crate::services::{ConversionError, ConversionRequest, OutputRef};
use crate::state_machine::{UnitEvent, UnitState, UnitStateMachine};

pub const CANCELLED_BEFORE_START: &str = "job cancelled before unit started";

/// What happened to a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExecutionOutcome {
    /// The dispatch was stale or lost the claim; nothing was written
    Skipped,
    /// Pending unit of a cancelled job failed without an attempt
    Abandoned,
    Completed { attempt: u32 },
    RetryScheduled { attempt: u32 },
    Failed { attempt: u32 },
}

#[derive(Debug)]
pub struct UnitExecutor {
    context: SystemContext,
    dispatcher: DispatchHandle,
    finalizer: JobFinalizer,
}

impl UnitExecutor {
    pub fn new(context: SystemContext, dispatcher: DispatchHandle) -> Self {
        let finalizer = JobFinalizer::new(context.clone());
        Self {
            context,
            dispatcher,
            finalizer,
        }
    }

    pub async fn execute(&self, dispatch: UnitDispatch) -> Result<UnitExecutionOutcome> {
        let UnitDispatch { job_id, unit_id } = dispatch;
        let store = &self.context.store;
        let max_attempts = self.context.config.retry.max_attempts;

        let job = store
            .get_job(job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))?;
        let unit = store
            .get_unit(unit_id)
            .await?
            .ok_or(BatchError::UnitNotFound(unit_id))?;

        if unit.job_id != job_id {
            return Err(BatchError::internal(format!(
                "unit {unit_id} dispatched for job {job_id} belongs to job {}",
                unit.job_id
            )));
        }

        if unit.is_terminal() {
            debug!(job_id = %job_id, unit_id = %unit_id, status = %unit.status, "Stale dispatch for terminal unit");
            return Ok(UnitExecutionOutcome::Skipped);
        }

        if job.cancel_requested && unit.status == UnitState::Pending {
            return self.abandon(&unit).await;
        }

        let Some(claimed) = store.claim_unit(unit_id, max_attempts).await? else {
            debug!(job_id = %job_id, unit_id = %unit_id, "Unit already claimed, dropping dispatch");
            return Ok(UnitExecutionOutcome::Skipped);
        };
        let attempt = claimed.attempt_count;

        log_unit_operation("claim", job_id, unit_id, Some(attempt), UnitState::Processing.as_str(), None);

        let request = ConversionRequest {
            job_id,
            unit_id,
            source_ref: claimed.source_ref.clone(),
            attempt,
        };

        match self.run_converter(&request).await {
            Ok(output_ref) => self.complete(&claimed, output_ref).await,
            Err(err) => self.handle_failure(dispatch, &claimed, err).await,
        }
    }

    /// Invoke the converter with the timeout applied and panics caught
    async fn run_converter(
        &self,
        request: &ConversionRequest,
    ) -> std::result::Result<OutputRef, ConversionError> {
        let timeout = self.context.config.execution.conversion_timeout();
        let started = Instant::now();

        let execution = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.context.converter.convert(request)).catch_unwind(),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match execution {
            Ok(Ok(Ok(output_ref))) => {
                debug!(
                    job_id = %request.job_id,
                    unit_id = %request.unit_id,
                    attempt = request.attempt,
                    elapsed_ms,
                    "Conversion succeeded"
                );
                Ok(output_ref)
            }
            Ok(Ok(Err(err))) => {
                warn!(
                    job_id = %request.job_id,
                    unit_id = %request.unit_id,
                    attempt = request.attempt,
                    elapsed_ms,
                    error = %err,
                    "Conversion failed"
                );
                Err(err)
            }
            Ok(Err(panic_error)) => {
                let panic_msg = if let Some(s) = panic_error.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_error.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    job_id = %request.job_id,
                    unit_id = %request.unit_id,
                    attempt = request.attempt,
                    panic_msg = %panic_msg,
                    "Converter panicked"
                );
                Err(ConversionError::Panicked(panic_msg))
            }
            Err(_) => {
                warn!(
                    job_id = %request.job_id,
                    unit_id = %request.unit_id,
                    attempt = request.attempt,
                    timeout_secs = timeout.as_secs(),
                    "Conversion timed out"
                );
                Err(ConversionError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    async fn complete(&self, unit: &Unit, output_ref: OutputRef) -> Result<UnitExecutionOutcome> {
        let attempt = unit.attempt_count;
        let recorded = self
            .context
            .store
            .record_unit_outcome(
                unit.unit_id,
                UnitState::Processing,
                attempt,
                &UnitOutcome::Completed { output_ref },
            )
            .await?;

        if recorded.is_none() {
            warn!(job_id = %unit.job_id, unit_id = %unit.unit_id, attempt, "Attempt superseded before its result was recorded");
            return Ok(UnitExecutionOutcome::Skipped);
        }

        self.context.events.publish(LifecycleEvent::UnitCompleted {
            job_id: unit.job_id,
            unit_id: unit.unit_id,
            attempt,
        });
        log_unit_operation("complete", unit.job_id, unit.unit_id, Some(attempt), UnitState::Completed.as_str(), None);

        self.finalizer
            .handle_unit_terminal(unit.job_id, unit.unit_id)
            .await?;
        Ok(UnitExecutionOutcome::Completed { attempt })
    }

    async fn handle_failure(
        &self,
        dispatch: UnitDispatch,
        unit: &Unit,
        err: ConversionError,
    ) -> Result<UnitExecutionOutcome> {
        let store = &self.context.store;
        let retry = &self.context.config.retry;
        let attempt = unit.attempt_count;
        let message = err.to_string();

        let job_cancelled = store
            .get_job(unit.job_id)
            .await?
            .is_some_and(|job| job.cancel_requested);

        let sm = UnitStateMachine::for_unit(unit, retry.max_attempts);
        if let UnitEvent::Retry = sm.failure_event(message.clone(), job_cancelled) {
            if !store.release_unit(unit.unit_id, attempt).await? {
                warn!(job_id = %unit.job_id, unit_id = %unit.unit_id, attempt, "Attempt superseded before it could be retried");
                return Ok(UnitExecutionOutcome::Skipped);
            }

            let delay = retry.backoff_for(attempt);
            self.context.events.publish(LifecycleEvent::UnitRetrying {
                job_id: unit.job_id,
                unit_id: unit.unit_id,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: message.clone(),
            });
            log_unit_operation(
                "retry",
                unit.job_id,
                unit.unit_id,
                Some(attempt),
                UnitState::Pending.as_str(),
                Some(&message),
            );
            self.dispatcher.dispatch_after(dispatch, delay);
            return Ok(UnitExecutionOutcome::RetryScheduled { attempt });
        }

        let recorded = store
            .record_unit_outcome(
                unit.unit_id,
                UnitState::Processing,
                attempt,
                &UnitOutcome::Failed {
                    error: message.clone(),
                },
            )
            .await?;

        if recorded.is_none() {
            warn!(job_id = %unit.job_id, unit_id = %unit.unit_id, attempt, "Attempt superseded before its failure was recorded");
            return Ok(UnitExecutionOutcome::Skipped);
        }

        self.context.events.publish(LifecycleEvent::UnitFailed {
            job_id: unit.job_id,
            unit_id: unit.unit_id,
            attempt,
            error: message.clone(),
        });
        log_unit_operation(
            "fail",
            unit.job_id,
            unit.unit_id,
            Some(attempt),
            UnitState::Failed.as_str(),
            Some(&message),
        );

        self.finalizer
            .handle_unit_terminal(unit.job_id, unit.unit_id)
            .await?;
        Ok(UnitExecutionOutcome::Failed { attempt })
    }

    async fn abandon(&self, unit: &Unit) -> Result<UnitExecutionOutcome> {
        let recorded = self
            .context
            .store
            .record_unit_outcome(
                unit.unit_id,
                UnitState::Pending,
                unit.attempt_count,
                &UnitOutcome::Failed {
                    error: CANCELLED_BEFORE_START.to_string(),
                },
            )
            .await?;

        if recorded.is_none() {
            debug!(job_id = %unit.job_id, unit_id = %unit.unit_id, "Unit moved on before it could be abandoned");
            return Ok(UnitExecutionOutcome::Skipped);
        }

        self.context.events.publish(LifecycleEvent::UnitFailed {
            job_id: unit.job_id,
            unit_id: unit.unit_id,
            attempt: unit.attempt_count,
            error: CANCELLED_BEFORE_START.to_string(),
        });
        log_unit_operation(
            "abandon",
            unit.job_id,
            unit.unit_id,
            None,
            UnitState::Failed.as_str(),
            Some(CANCELLED_BEFORE_START),
        );

        self.finalizer
            .handle_unit_terminal(unit.job_id, unit.unit_id)
            .await?;
        Ok(UnitExecutionOutcome::Abandoned)
    }
}

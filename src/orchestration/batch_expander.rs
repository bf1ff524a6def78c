//! # Batch Expander
//!
//! Fan-out step of a job: turns one submitted batch into units.
//!
//! The job moves `PENDING -> EXPANDING`, the batch source enumerates the
//! members, the units and `total_units` are written in one store call, the
//! completion barrier is seeded with the same count and only then does the job
//! move to `IN_PROGRESS` and the units get dispatched. A unit can therefore
//! never notify the barrier before it knows how many notifications to expect.
//!
//! An unreadable or empty batch fails the job from `EXPANDING` with no units.
//! A store or barrier error after that point also fails the job before the
//! error is returned, so no job is left in `EXPANDING`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::SystemContext;
use super::types::UnitDispatch;
use super::worker_pool::DispatchHandle;
use crate::error::{BatchError, Result};
use crate::events::LifecycleEvent;
use crate::logging::{log_error, log_job_operation};
use crate::models::{JobCompletion, Unit};
use crate::services::ExpansionError;
use crate::state_machine::{JobEvent, JobState, JobStateMachine};

/// Result of expanding one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionResult {
    /// Units were created and dispatched
    Expanded { total_units: u32 },
    /// The batch could not be expanded and the job is FAILED
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct BatchExpander {
    context: SystemContext,
    dispatcher: DispatchHandle,
}

impl BatchExpander {
    pub fn new(context: SystemContext, dispatcher: DispatchHandle) -> Self {
        Self {
            context,
            dispatcher,
        }
    }

    pub async fn expand(&self, job_id: Uuid, batch_ref: &str) -> Result<ExpansionResult> {
        let store = &self.context.store;

        let job = store
            .get_job(job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))?;

        let mut sm = JobStateMachine::new(job.status);
        let expanding = sm.transition(&JobEvent::StartExpansion).map_err(|err| {
            BatchError::internal(format!("job {job_id} cannot start expansion: {err}"))
        })?;

        if !store
            .transition_job(job_id, JobState::Pending, expanding)
            .await?
        {
            let message = format!("job {job_id} was expanded twice");
            log_error("batch_expander", "start_expansion", &message, None);
            return Err(BatchError::InternalConsistency(message));
        }
        debug!(job_id = %job_id, batch_ref = %batch_ref, "Expanding batch");

        let items = match self.context.source.enumerate(job_id, batch_ref).await {
            Ok(items) if items.is_empty() => {
                let err = ExpansionError::Empty {
                    batch_ref: batch_ref.to_string(),
                };
                return self.fail_expansion(job_id, err.to_string()).await;
            }
            Ok(items) => items,
            Err(err) => return self.fail_expansion(job_id, err.to_string()).await,
        };

        let units: Vec<Unit> = items
            .into_iter()
            .map(|item| Unit::new(job_id, item.name, item.source_ref))
            .collect();

        let total_units = match store.insert_units(job_id, &units).await {
            Ok(total) => total,
            Err(err) => {
                let message = format!("failed to record units: {err}");
                return self.abort_expansion(job_id, message, err.into()).await;
            }
        };

        let in_progress = sm.transition(&JobEvent::UnitsExpanded(total_units))?;

        if let Err(err) = self.context.barrier.seed(job_id, total_units).await {
            log_error(
                "batch_expander",
                "seed_barrier",
                &err.to_string(),
                Some(&format!("job_id={job_id} total_units={total_units}")),
            );
            let message = format!("failed to seed completion barrier: {err}");
            return self.abort_expansion(job_id, message, err.into()).await;
        }

        match store
            .transition_job(job_id, JobState::Expanding, in_progress)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let message = format!("job {job_id} left EXPANDING while its units were created");
                log_error("batch_expander", "finish_expansion", &message, None);
                return Err(BatchError::InternalConsistency(message));
            }
            Err(err) => {
                if let Err(retire_err) = self.context.barrier.retire(job_id).await {
                    warn!(job_id = %job_id, error = %retire_err, "Failed to retire barrier of aborted expansion");
                }
                let message = format!("failed to start job: {err}");
                return self.abort_expansion(job_id, message, err.into()).await;
            }
        }

        self.context.events.publish(LifecycleEvent::JobExpanded {
            job_id,
            total_units,
        });
        log_job_operation(
            "expand",
            job_id,
            in_progress.as_str(),
            Some(&format!("total_units={total_units}")),
        );

        let mut dispatched = 0;
        for unit in &units {
            let dispatch = UnitDispatch {
                job_id,
                unit_id: unit.unit_id,
            };
            if let Err(err) = self.dispatcher.dispatch(dispatch).await {
                // Units stay PENDING; the recovery sweep re-dispatches them.
                warn!(job_id = %job_id, unit_id = %unit.unit_id, error = %err, "Unit dispatch failed");
                continue;
            }
            dispatched += 1;
        }
        info!(job_id = %job_id, total_units, dispatched, "Batch expanded");

        Ok(ExpansionResult::Expanded { total_units })
    }

    /// Fail a job whose expansion broke after it reached `EXPANDING`, then
    /// surface `cause`. Units already written stay `PENDING` and are never
    /// dispatched.
    async fn abort_expansion(
        &self,
        job_id: Uuid,
        message: String,
        cause: BatchError,
    ) -> Result<ExpansionResult> {
        if let Err(fail_err) = self.fail_expansion(job_id, message).await {
            error!(job_id = %job_id, error = %fail_err, cause = %cause, "Could not fail job after expansion error");
        }
        Err(cause)
    }

    async fn fail_expansion(&self, job_id: Uuid, message: String) -> Result<ExpansionResult> {
        let failed = JobStateMachine::determine_target_state(
            JobState::Expanding,
            &JobEvent::ExpansionFailed(message.clone()),
        )?;

        let completion = JobCompletion {
            status: failed,
            error: Some(message.clone()),
            archive_ref: None,
            finalized_at: Utc::now(),
        };

        if !self
            .context
            .store
            .complete_job(job_id, JobState::Expanding, &completion)
            .await?
        {
            let message = format!("job {job_id} left EXPANDING before its expansion failure was recorded");
            error!(job_id = %job_id, "{message}");
            return Err(BatchError::InternalConsistency(message));
        }

        warn!(job_id = %job_id, error = %message, "Batch expansion failed");
        self.context
            .events
            .publish(LifecycleEvent::JobExpansionFailed {
                job_id,
                error: message.clone(),
            });
        log_job_operation("expand", job_id, failed.as_str(), Some(&message));

        Ok(ExpansionResult::Failed { error: message })
    }
}

//! # Stuck Unit Recovery
//!
//! Periodic sweep that repairs work a crashed or cancelled worker left behind.
//!
//! Each pass handles four cases for live (`IN_PROGRESS`) jobs:
//!
//! - **Stuck units**: `PROCESSING` longer than the stuck-unit threshold
//!   ([`BatchConfig::stuck_unit_threshold`](crate::config::BatchConfig::stuck_unit_threshold)),
//!   which always outlasts the conversion timeout. With attempts left (and
//!   the job not cancelled) the attempt is released and the unit
//!   re-dispatched; otherwise the unit is failed and notifies the barrier.
//! - **Orphaned pending units**: `PENDING` units untouched for the stuck
//!   timeout, typically a dispatch lost at shutdown. They are re-dispatched;
//!   the claim compare-and-set drops any duplicate.
//! - **Missed notifications**: terminal units the barrier has not recorded,
//!   older than `recovery.notification_grace`. The notification is delivered
//!   again; a duplicate is rejected by the barrier.
//! - **Stalled finalization**: a drained barrier on a job still
//!   `IN_PROGRESS`. The finalizer is invoked directly; it is idempotent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::SystemContext;
use super::job_finalizer::JobFinalizer;
use super::types::UnitDispatch;
use super::worker_pool::DispatchHandle;
use crate::barrier::BarrierError;
use crate::error::{BatchError, Result};
use crate::events::LifecycleEvent;
use crate::logging::log_unit_operation;
use crate::models::{Job, Unit, UnitOutcome};
use crate::state_machine::{JobState, UnitEvent, UnitState, UnitStateMachine};

/// Counters for one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Stuck attempts released and re-dispatched
    pub requeued: u32,
    /// Stuck units failed because their attempts ran out or the job was cancelled
    pub failed: u32,
    /// Orphaned pending units re-dispatched
    pub redispatched: u32,
    /// Missed barrier notifications delivered again
    pub renotified: u32,
    /// Jobs finalized by the sweep
    pub finalized: u32,
    pub errors: u32,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct StuckUnitSweeper {
    context: SystemContext,
    dispatcher: DispatchHandle,
    finalizer: JobFinalizer,
}

impl StuckUnitSweeper {
    pub fn new(context: SystemContext, dispatcher: DispatchHandle) -> Self {
        let finalizer = JobFinalizer::new(context.clone());
        Self {
            context,
            dispatcher,
            finalizer,
        }
    }

    /// Sweep until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.context.config.recovery.sweep_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a fresh start does
        // not race the expansions it is about to dispatch.
        interval.tick().await;

        info!(interval_secs = period.as_secs(), "Recovery sweeper starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.is_empty() => debug!("Recovery sweep found nothing to repair"),
                        Ok(report) => info!(?report, "Recovery sweep repaired work"),
                        Err(err) => warn!(error = %err, "Recovery sweep failed"),
                    }
                }
            }
        }
        info!("Recovery sweeper stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep with `now` as the reference time for every age threshold
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let recovery = &self.context.config.recovery;
        let stuck_threshold = self.context.config.stuck_unit_threshold();
        let stuck_before = older_than(now, stuck_threshold);
        let grace_before = older_than(now, recovery.notification_grace());
        let mut report = SweepReport::default();

        for unit in self.context.store.find_stuck_units(stuck_before).await? {
            if let Err(err) = self
                .recover_stuck_unit(&unit, stuck_threshold, &mut report)
                .await
            {
                report.errors += 1;
                warn!(job_id = %unit.job_id, unit_id = %unit.unit_id, error = %err, "Failed to recover stuck unit");
            }
        }

        for job in self.context.store.jobs_in_state(JobState::InProgress).await? {
            if let Err(err) = self
                .repair_job(&job, stuck_before, grace_before, &mut report)
                .await
            {
                report.errors += 1;
                warn!(job_id = %job.job_id, error = %err, "Failed to repair job");
            }
        }

        Ok(report)
    }

    async fn recover_stuck_unit(
        &self,
        unit: &Unit,
        threshold: Duration,
        report: &mut SweepReport,
    ) -> Result<()> {
        let store = &self.context.store;
        let max_attempts = self.context.config.retry.max_attempts;
        let timeout_secs = threshold.as_secs();
        let attempt = unit.attempt_count;

        let job_cancelled = store
            .get_job(unit.job_id)
            .await?
            .is_some_and(|job| job.cancel_requested);

        let message = format!("unit exceeded processing timeout of {timeout_secs}s");
        let sm = UnitStateMachine::for_unit(unit, max_attempts);

        if let UnitEvent::Retry = sm.failure_event(message.clone(), job_cancelled) {
            if store.release_unit(unit.unit_id, attempt).await? {
                warn!(job_id = %unit.job_id, unit_id = %unit.unit_id, attempt, "Requeueing stuck unit");
                self.dispatcher
                    .dispatch(UnitDispatch {
                        job_id: unit.job_id,
                        unit_id: unit.unit_id,
                    })
                    .await?;
                report.requeued += 1;
            }
            return Ok(());
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
            // The attempt finished while the sweep was looking at it.
            return Ok(());
        }

        self.context.events.publish(LifecycleEvent::UnitFailed {
            job_id: unit.job_id,
            unit_id: unit.unit_id,
            attempt,
            error: message.clone(),
        });
        log_unit_operation(
            "recover",
            unit.job_id,
            unit.unit_id,
            Some(attempt),
            UnitState::Failed.as_str(),
            Some(&message),
        );
        report.failed += 1;

        self.finalizer
            .handle_unit_terminal(unit.job_id, unit.unit_id)
            .await?;
        Ok(())
    }

    async fn repair_job(
        &self,
        job: &Job,
        stuck_before: DateTime<Utc>,
        grace_before: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let units = self.context.store.list_units(job.job_id).await?;

        for unit in &units {
            match unit.status {
                UnitState::Pending if unit.updated_at < stuck_before => {
                    debug!(job_id = %job.job_id, unit_id = %unit.unit_id, "Re-dispatching orphaned pending unit");
                    self.dispatcher
                        .dispatch(UnitDispatch {
                            job_id: job.job_id,
                            unit_id: unit.unit_id,
                        })
                        .await?;
                    report.redispatched += 1;
                }
                UnitState::Completed | UnitState::Failed if unit.updated_at < grace_before => {
                    if self.renotify(job.job_id, unit.unit_id).await? {
                        report.renotified += 1;
                    }
                }
                _ => {}
            }
        }

        let settled = units.iter().all(|u| u.is_terminal() && u.updated_at < grace_before);
        let job = match self.context.store.get_job(job.job_id).await? {
            Some(job) if job.status == JobState::InProgress => job,
            _ => return Ok(()),
        };
        if settled
            && job.counts().is_drained()
            && self.context.barrier.outstanding(job.job_id).await? == Some(0)
        {
            warn!(job_id = %job.job_id, "Finalizing job left IN_PROGRESS with a drained barrier");
            self.finalizer.finalize(job.job_id).await?;
            report.finalized += 1;
        }

        Ok(())
    }

    /// Deliver a notification the barrier never recorded. Returns whether a
    /// notification was delivered.
    async fn renotify(&self, job_id: Uuid, unit_id: Uuid) -> Result<bool> {
        if self.context.barrier.has_notified(job_id, unit_id).await? {
            return Ok(false);
        }

        warn!(job_id = %job_id, unit_id = %unit_id, "Re-delivering missed barrier notification");
        match self.finalizer.handle_unit_terminal(job_id, unit_id).await {
            Ok(_) => Ok(true),
            // A worker delivered it between the check and the notify.
            Err(BatchError::Barrier(BarrierError::DuplicateNotification { .. })) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn older_than(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

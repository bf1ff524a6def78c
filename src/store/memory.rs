use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{StateStore, StoreError, StoreResult};
use crate::models::{Job, JobCompletion, JobCounts, Unit, UnitOutcome};
use crate::state_machine::{JobState, UnitEvent, UnitState, UnitStateMachine};

/// In-process state store.
///
/// Records live in `DashMap`s, so unrelated jobs never contend on a global
/// lock. Operations touching both a job and one of its units always lock the
/// job entry first, then the unit entry.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    jobs: DashMap<Uuid, Job>,
    units: DashMap<Uuid, Unit>,
    job_units: DashMap<Uuid, Vec<Uuid>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn job_of(&self, unit_id: Uuid) -> StoreResult<Uuid> {
        self.units
            .get(&unit_id)
            .map(|unit| unit.job_id)
            .ok_or_else(|| StoreError::unit_not_found(unit_id))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        match self.jobs.entry(job.job_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "job {} already exists",
                job.job_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.jobs.get(&job_id).map(|job| job.clone()))
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: JobState,
        to: JobState,
    ) -> StoreResult<bool> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;

        if job.status != from {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_units(&self, job_id: Uuid, units: &[Unit]) -> StoreResult<u32> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;

        if job.status != JobState::Expanding {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is {} while inserting units",
                job.status
            )));
        }
        if self.job_units.contains_key(&job_id) {
            return Err(StoreError::Conflict(format!(
                "job {job_id} already has units"
            )));
        }

        let total = u32::try_from(units.len())
            .map_err(|_| StoreError::Conflict(format!("job {job_id} has too many units")))?;

        let mut ids = Vec::with_capacity(units.len());
        for unit in units {
            ids.push(unit.unit_id);
            self.units.insert(unit.unit_id, unit.clone());
        }
        self.job_units.insert(job_id, ids);

        job.total_units = total;
        job.updated_at = Utc::now();
        Ok(total)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        from: JobState,
        completion: &JobCompletion,
    ) -> StoreResult<bool> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;

        if job.status != from || job.status.is_terminal() {
            return Ok(false);
        }
        job.status = completion.status;
        job.error = completion.error.clone();
        job.archive_ref = completion.archive_ref.clone();
        job.finalized_at = Some(completion.finalized_at);
        job.updated_at = completion.finalized_at;
        Ok(true)
    }

    async fn request_cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;

        if job.status.is_terminal() {
            return Ok(false);
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|job| job.status == state)
            .map(|job| job.clone())
            .collect())
    }

    async fn get_unit(&self, unit_id: Uuid) -> StoreResult<Option<Unit>> {
        Ok(self.units.get(&unit_id).map(|unit| unit.clone()))
    }

    async fn list_units(&self, job_id: Uuid) -> StoreResult<Vec<Unit>> {
        let ids = match self.job_units.get(&job_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };

        let mut units: Vec<Unit> = ids
            .iter()
            .filter_map(|id| self.units.get(id).map(|unit| unit.clone()))
            .collect();
        units.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        Ok(units)
    }

    async fn claim_unit(&self, unit_id: Uuid, max_attempts: u32) -> StoreResult<Option<Unit>> {
        let mut unit = self
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| StoreError::unit_not_found(unit_id))?;

        if unit.status != UnitState::Pending {
            return Ok(None);
        }

        let mut sm = UnitStateMachine::for_unit(&unit, max_attempts);
        sm.transition(&UnitEvent::Claim)?;

        let now = Utc::now();
        unit.status = sm.current_state();
        unit.attempt_count = sm.attempt_count();
        unit.claimed_at = Some(now);
        unit.updated_at = now;
        Ok(Some(unit.clone()))
    }

    async fn release_unit(&self, unit_id: Uuid, attempt: u32) -> StoreResult<bool> {
        let mut unit = self
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| StoreError::unit_not_found(unit_id))?;

        if unit.status != UnitState::Processing || unit.attempt_count != attempt {
            return Ok(false);
        }
        unit.status = UnitState::Pending;
        unit.claimed_at = None;
        unit.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        expected: UnitState,
        attempt: u32,
        outcome: &UnitOutcome,
    ) -> StoreResult<Option<JobCounts>> {
        let job_id = self.job_of(unit_id)?;
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;
        let mut unit = self
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| StoreError::unit_not_found(unit_id))?;

        if unit.status != expected || unit.attempt_count != attempt {
            return Ok(None);
        }

        let event = match (outcome, expected) {
            (UnitOutcome::Completed { output_ref }, _) => UnitEvent::Succeed(output_ref.clone()),
            (UnitOutcome::Failed { error }, UnitState::Pending) => UnitEvent::Abandon(error.clone()),
            (UnitOutcome::Failed { error }, _) => UnitEvent::Fail(error.clone()),
        };
        // Terminal events are not bounded by the attempt budget.
        let mut sm = UnitStateMachine::new(unit.status, unit.attempt_count, u32::MAX);
        sm.transition(&event)?;

        let mut counts = job.counts();
        match outcome {
            UnitOutcome::Completed { .. } => counts.completed += 1,
            UnitOutcome::Failed { .. } => counts.failed += 1,
        }
        if !counts.is_consistent() {
            return Err(StoreError::Conflict(format!(
                "job {job_id} counters would exceed total: {counts:?}"
            )));
        }

        let now = Utc::now();
        unit.status = sm.current_state();
        match outcome {
            UnitOutcome::Completed { output_ref } => unit.output_ref = Some(output_ref.clone()),
            UnitOutcome::Failed { error } => unit.error = Some(error.clone()),
        }
        unit.updated_at = now;

        job.completed_units = counts.completed;
        job.failed_units = counts.failed;
        job.updated_at = now;

        Ok(Some(counts))
    }

    async fn find_stuck_units(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<Unit>> {
        Ok(self
            .units
            .iter()
            .filter(|unit| {
                unit.status == UnitState::Processing
                    && unit.claimed_at.is_some_and(|at| at < claimed_before)
            })
            .map(|unit| unit.clone())
            .collect())
    }
}

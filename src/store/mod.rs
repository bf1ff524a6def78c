//! # State Store
//!
//! Persistence boundary for [`Job`] and [`Unit`] records.
//!
//! Every mutating operation is a compare-and-set against the state the caller
//! observed, so two workers can never both apply a transition from the same
//! source state. Terminal unit transitions and the owning job's counter
//! increment are applied together in [`StateStore::record_unit_outcome`].
//!
//! Two implementations ship with the crate:
//! - [`InMemoryStateStore`]: `DashMap`-backed, per-record locking
//! - `PgStateStore` (feature `postgres`): row-level locking in PostgreSQL

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, JobCompletion, JobCounts, Unit, UnitOutcome};
use crate::state_machine::{JobState, StateMachineError, UnitState};

pub use memory::InMemoryStateStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStateStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Rejected transition: {0}")]
    Transition(#[from] StateMachineError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "Job", id }
    }

    pub fn unit_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "Unit", id }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations used by the orchestration components
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn create_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;

    /// Move a job between non-terminal states. Returns `false` when the job
    /// was no longer in `from`.
    async fn transition_job(&self, job_id: Uuid, from: JobState, to: JobState)
        -> StoreResult<bool>;

    /// Create the job's units and fix `total_units` in one step. The job must
    /// be `EXPANDING` and must not have units yet.
    async fn insert_units(&self, job_id: Uuid, units: &[Unit]) -> StoreResult<u32>;

    /// Write a terminal job status. Returns `false` (and writes nothing) when
    /// the job was no longer in `from`, which makes finalization idempotent.
    async fn complete_job(
        &self,
        job_id: Uuid,
        from: JobState,
        completion: &JobCompletion,
    ) -> StoreResult<bool>;

    /// Flag a live job as cancelled. Returns `false` for terminal jobs.
    async fn request_cancel(&self, job_id: Uuid) -> StoreResult<bool>;

    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>>;

    async fn get_unit(&self, unit_id: Uuid) -> StoreResult<Option<Unit>>;

    /// Units of a job ordered by source name
    async fn list_units(&self, job_id: Uuid) -> StoreResult<Vec<Unit>>;

    /// `PENDING -> PROCESSING`, consuming one attempt. Returns `None` when the
    /// unit is not pending (another dispatch owns it or it is terminal).
    async fn claim_unit(&self, unit_id: Uuid, max_attempts: u32) -> StoreResult<Option<Unit>>;

    /// `PROCESSING -> PENDING` for the given attempt, ahead of a retry
    async fn release_unit(&self, unit_id: Uuid, attempt: u32) -> StoreResult<bool>;

    /// Apply a unit's single terminal transition and bump the owning job's
    /// `completed_units` or `failed_units` atomically. `expected` and
    /// `attempt` must match the stored unit, otherwise nothing is written and
    /// `None` is returned.
    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        expected: UnitState,
        attempt: u32,
        outcome: &UnitOutcome,
    ) -> StoreResult<Option<JobCounts>>;

    /// Units in `PROCESSING` whose current attempt started before `claimed_before`
    async fn find_stuck_units(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<Unit>>;
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StateStore, StoreError, StoreResult};
use crate::models::{Job, JobCompletion, JobCounts, Unit, UnitOutcome};
use crate::state_machine::{JobState, UnitEvent, UnitState, UnitStateMachine};

const JOB_COLUMNS: &str = "job_id, batch_ref, status, total_units, completed_units, failed_units, \
     error, cancel_requested, archive_ref, created_at, updated_at, finalized_at";

const UNIT_COLUMNS: &str = "unit_id, job_id, source_name, source_ref, status, attempt_count, \
     error, output_ref, claimed_at, created_at, updated_at";

/// State store over the `docbatch_jobs` and `docbatch_units` tables.
///
/// Compare-and-set transitions are expressed as `UPDATE ... WHERE status = $n`;
/// the unit terminal write and the job counter increment share a transaction
/// holding row locks on both records.
///
/// Timestamps are bound from the engine clock rather than the database's
/// `now()`, since the recovery sweep compares them against engine time.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn job_exists(&self, job_id: Uuid) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM docbatch_jobs WHERE job_id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Resolve a zero-row CAS into `Ok(false)` or `NotFound`
    async fn cas_missed(&self, job_id: Uuid) -> StoreResult<bool> {
        if self.job_exists(job_id).await? {
            Ok(false)
        } else {
            Err(StoreError::job_not_found(job_id))
        }
    }
}

fn count_from(row: &PgRow, column: &str) -> StoreResult<u32> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        batch_ref: row.try_get("batch_ref")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        total_units: count_from(row, "total_units")?,
        completed_units: count_from(row, "completed_units")?,
        failed_units: count_from(row, "failed_units")?,
        error: row.try_get("error")?,
        cancel_requested: row.try_get("cancel_requested")?,
        archive_ref: row.try_get("archive_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

fn unit_from_row(row: &PgRow) -> StoreResult<Unit> {
    let status: String = row.try_get("status")?;
    Ok(Unit {
        unit_id: row.try_get("unit_id")?,
        job_id: row.try_get("job_id")?,
        source_name: row.try_get("source_name")?,
        source_ref: row.try_get("source_ref")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        attempt_count: count_from(row, "attempt_count")?,
        error: row.try_get("error")?,
        output_ref: row.try_get("output_ref")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO docbatch_jobs
                (job_id, batch_ref, status, total_units, completed_units, failed_units,
                 error, cancel_requested, archive_ref, created_at, updated_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.batch_ref)
        .bind(job.status.as_str())
        .bind(job.total_units as i32)
        .bind(job.completed_units as i32)
        .bind(job.failed_units as i32)
        .bind(&job.error)
        .bind(job.cancel_requested)
        .bind(&job.archive_ref)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finalized_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM docbatch_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: JobState,
        to: JobState,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE docbatch_jobs
            SET status = $3, updated_at = $4
            WHERE job_id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return self.cas_missed(job_id).await;
        }
        Ok(true)
    }

    async fn insert_units(&self, job_id: Uuid, units: &[Unit]) -> StoreResult<u32> {
        let total = i32::try_from(units.len())
            .map_err(|_| StoreError::Conflict(format!("job {job_id} has too many units")))?;

        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM docbatch_jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status: JobState = status
            .ok_or_else(|| StoreError::job_not_found(job_id))?
            .parse()
            .map_err(StoreError::Corrupt)?;

        if status != JobState::Expanding {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is {status} while inserting units"
            )));
        }

        let has_units: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM docbatch_units WHERE job_id = $1)")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
        if has_units {
            return Err(StoreError::Conflict(format!(
                "job {job_id} already has units"
            )));
        }

        for unit in units {
            sqlx::query(
                r#"
                INSERT INTO docbatch_units
                    (unit_id, job_id, source_name, source_ref, status, attempt_count,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(unit.unit_id)
            .bind(job_id)
            .bind(&unit.source_name)
            .bind(&unit.source_ref)
            .bind(unit.status.as_str())
            .bind(unit.attempt_count as i32)
            .bind(unit.created_at)
            .bind(unit.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE docbatch_jobs SET total_units = $2, updated_at = $3 WHERE job_id = $1")
            .bind(job_id)
            .bind(total)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(total as u32)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        from: JobState,
        completion: &JobCompletion,
    ) -> StoreResult<bool> {
        if from.is_terminal() {
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE docbatch_jobs
            SET status = $3, error = $4, archive_ref = $5,
                finalized_at = $6, updated_at = $6
            WHERE job_id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(completion.status.as_str())
        .bind(&completion.error)
        .bind(&completion.archive_ref)
        .bind(completion.finalized_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return self.cas_missed(job_id).await;
        }
        Ok(true)
    }

    async fn request_cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE docbatch_jobs
            SET cancel_requested = TRUE, updated_at = $2
            WHERE job_id = $1
              AND status NOT IN ('COMPLETED', 'COMPLETED_WITH_ERRORS', 'FAILED')
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return self.cas_missed(job_id).await;
        }
        Ok(true)
    }

    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM docbatch_jobs WHERE status = $1 ORDER BY created_at"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn get_unit(&self, unit_id: Uuid) -> StoreResult<Option<Unit>> {
        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM docbatch_units WHERE unit_id = $1"
        ))
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(unit_from_row).transpose()
    }

    async fn list_units(&self, job_id: Uuid) -> StoreResult<Vec<Unit>> {
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM docbatch_units WHERE job_id = $1 ORDER BY source_name"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn claim_unit(&self, unit_id: Uuid, max_attempts: u32) -> StoreResult<Option<Unit>> {
        let current = self
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| StoreError::unit_not_found(unit_id))?;

        if current.status != UnitState::Pending {
            return Ok(None);
        }
        UnitStateMachine::for_unit(&current, max_attempts).transition(&UnitEvent::Claim)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE docbatch_units
            SET status = 'PROCESSING', attempt_count = attempt_count + 1,
                claimed_at = $3, updated_at = $3
            WHERE unit_id = $1 AND status = 'PENDING' AND attempt_count = $2
            RETURNING {UNIT_COLUMNS}
            "#
        ))
        .bind(unit_id)
        .bind(current.attempt_count as i32)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(unit_from_row).transpose()
    }

    async fn release_unit(&self, unit_id: Uuid, attempt: u32) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE docbatch_units
            SET status = 'PENDING', claimed_at = NULL, updated_at = $3
            WHERE unit_id = $1 AND status = 'PROCESSING' AND attempt_count = $2
            "#,
        )
        .bind(unit_id)
        .bind(attempt as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        expected: UnitState,
        attempt: u32,
        outcome: &UnitOutcome,
    ) -> StoreResult<Option<JobCounts>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM docbatch_units WHERE unit_id = $1 FOR UPDATE"
        ))
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?;
        let unit = row
            .as_ref()
            .map(unit_from_row)
            .transpose()?
            .ok_or_else(|| StoreError::unit_not_found(unit_id))?;

        if unit.status != expected || unit.attempt_count != attempt {
            return Ok(None);
        }

        let event = match (outcome, expected) {
            (UnitOutcome::Completed { output_ref }, _) => UnitEvent::Succeed(output_ref.clone()),
            (UnitOutcome::Failed { error }, UnitState::Pending) => UnitEvent::Abandon(error.clone()),
            (UnitOutcome::Failed { error }, _) => UnitEvent::Fail(error.clone()),
        };
        let target = UnitStateMachine::new(unit.status, unit.attempt_count, u32::MAX)
            .transition(&event)?;

        let now = Utc::now();
        let (output_ref, error) = match outcome {
            UnitOutcome::Completed { output_ref } => (Some(output_ref.as_str()), None),
            UnitOutcome::Failed { error } => (None, Some(error.as_str())),
        };

        sqlx::query(
            r#"
            UPDATE docbatch_units
            SET status = $2, output_ref = COALESCE($3, output_ref), error = COALESCE($4, error),
                updated_at = $5
            WHERE unit_id = $1
            "#,
        )
        .bind(unit_id)
        .bind(target.as_str())
        .bind(output_ref)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let counter_sql = match outcome {
            UnitOutcome::Completed { .. } => {
                "UPDATE docbatch_jobs SET completed_units = completed_units + 1, updated_at = $2 \
                 WHERE job_id = $1 AND completed_units + failed_units < total_units \
                 RETURNING total_units, completed_units, failed_units"
            }
            UnitOutcome::Failed { .. } => {
                "UPDATE docbatch_jobs SET failed_units = failed_units + 1, updated_at = $2 \
                 WHERE job_id = $1 AND completed_units + failed_units < total_units \
                 RETURNING total_units, completed_units, failed_units"
            }
        };

        let counters = sqlx::query(counter_sql)
            .bind(unit.job_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "job {} counters would exceed total_units",
                    unit.job_id
                ))
            })?;

        let counts = JobCounts {
            total: count_from(&counters, "total_units")?,
            completed: count_from(&counters, "completed_units")?,
            failed: count_from(&counters, "failed_units")?,
        };

        tx.commit().await?;
        Ok(Some(counts))
    }

    async fn find_stuck_units(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<Unit>> {
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM docbatch_units \
             WHERE status = 'PROCESSING' AND claimed_at < $1 ORDER BY claimed_at"
        ))
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(unit_from_row).collect()
    }
}

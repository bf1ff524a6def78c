use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{BarrierError, BarrierResult, BarrierSignal, CompletionBarrier};

/// Barrier backed by `docbatch_barriers` and `docbatch_barrier_notifications`.
///
/// Each notification runs in one transaction that locks the job's barrier row,
/// records the notifying unit and decrements the counter, so concurrent
/// notifiers in different processes still see exactly one release.
#[derive(Debug, Clone)]
pub struct PgCompletionBarrier {
    pool: PgPool,
}

impl PgCompletionBarrier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompletionBarrier for PgCompletionBarrier {
    async fn seed(&self, job_id: Uuid, total_units: u32) -> BarrierResult<()> {
        if total_units == 0 {
            return Err(BarrierError::ZeroSeed { job_id });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO docbatch_barriers (job_id, seeded, outstanding)
            VALUES ($1, $2, $2)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(total_units as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(BarrierError::AlreadySeeded { job_id });
        }
        Ok(())
    }

    async fn notify(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<BarrierSignal> {
        let mut tx = self.pool.begin().await?;

        let outstanding: Option<i32> = sqlx::query_scalar(
            "SELECT outstanding FROM docbatch_barriers WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(outstanding) = outstanding else {
            return Err(BarrierError::NotSeeded { job_id });
        };

        let recorded = sqlx::query(
            r#"
            INSERT INTO docbatch_barrier_notifications (job_id, unit_id)
            VALUES ($1, $2)
            ON CONFLICT (job_id, unit_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(unit_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if recorded == 0 {
            return Err(BarrierError::DuplicateNotification { job_id, unit_id });
        }
        if outstanding <= 0 {
            return Err(BarrierError::Exhausted { job_id, unit_id });
        }

        let remaining: i32 = sqlx::query_scalar(
            r#"
            UPDATE docbatch_barriers
            SET outstanding = outstanding - 1
            WHERE job_id = $1 AND outstanding > 0
            RETURNING outstanding
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if remaining == 0 {
            Ok(BarrierSignal::Released)
        } else {
            Ok(BarrierSignal::Pending {
                outstanding: remaining as u32,
            })
        }
    }

    async fn outstanding(&self, job_id: Uuid) -> BarrierResult<Option<u32>> {
        let row = sqlx::query("SELECT outstanding FROM docbatch_barriers WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let outstanding: i32 = row.try_get("outstanding")?;
                Ok(Some(outstanding.max(0) as u32))
            }
            None => Ok(None),
        }
    }

    async fn has_notified(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM docbatch_barrier_notifications
                WHERE job_id = $1 AND unit_id = $2
            )
            "#,
        )
        .bind(job_id)
        .bind(unit_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn retire(&self, job_id: Uuid) -> BarrierResult<()> {
        sqlx::query("DELETE FROM docbatch_barriers WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
